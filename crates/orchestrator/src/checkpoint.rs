//! Checkpoint records.
//!
//! A restart folder holds one `_simulation.state` text record (written by
//! rank 0) plus per-component files named by registered object and rank.
//! Particle vectors persist their intrinsics and persistent channels as JSON;
//! numbers round-trip exactly, so a checkpoint/restart pair reproduces the
//! run bit-for-bit.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use glam::Vec3;
use kernel::channels::{Channel, Persistence};
use kernel::error::{Result, SimulationError};
use kernel::particles::ParticleVector;

/// Name of the clock record inside a restart folder.
pub const STATE_RECORD: &str = "_simulation.state";

/// Create the folder if needed.
pub fn ensure_folder(folder: &Path) -> Result<()> {
    fs::create_dir_all(folder)?;
    Ok(())
}

/// Per-rank file of one named component.
pub fn component_path(folder: &Path, name: &str, rank: usize) -> PathBuf {
    folder.join(format!("{name}.{rank:03}.json"))
}

#[derive(Serialize, Deserialize)]
struct PvRecord {
    mass: f32,
    positions: Vec<Vec3>,
    velocities: Vec<Vec3>,
    ids: Vec<u64>,
    channels: BTreeMap<String, Channel>,
    object_channels: Option<BTreeMap<String, Channel>>,
}

fn persistent_channels(m: &kernel::ExtraDataManager) -> Result<BTreeMap<String, Channel>> {
    let mut out = BTreeMap::new();
    for name in m.names_with_persistence(Persistence::Persistent) {
        out.insert(
            name.clone(),
            Channel {
                persistence: Persistence::Persistent,
                data: m.data(&name)?.clone(),
            },
        );
    }
    Ok(out)
}

/// Write one particle vector's state.
pub fn checkpoint_pv(pv: &ParticleVector, rank: usize, folder: &Path) -> Result<()> {
    let record = PvRecord {
        mass: pv.mass,
        positions: pv.local.positions.clone(),
        velocities: pv.local.velocities.clone(),
        ids: pv.local.ids.clone(),
        channels: persistent_channels(&pv.local.channels)?,
        object_channels: match &pv.objects {
            Some(info) => Some(persistent_channels(&info.local)?),
            None => None,
        },
    };
    let path = component_path(folder, pv.name(), rank);
    let json = serde_json::to_string(&record)
        .map_err(|e| SimulationError::Restart(format!("cannot encode '{}': {e}", pv.name())))?;
    fs::write(&path, json)?;
    tracing::info!(pv = pv.name(), path = %path.display(), "checkpoint written");
    Ok(())
}

/// Read one particle vector's state back.
pub fn restart_pv(pv: &mut ParticleVector, rank: usize, folder: &Path) -> Result<()> {
    let path = component_path(folder, pv.name(), rank);
    let text = fs::read_to_string(&path).map_err(|e| {
        SimulationError::Restart(format!(
            "missing restart record for '{}' at {}: {e}",
            pv.name(),
            path.display()
        ))
    })?;
    let record: PvRecord = serde_json::from_str(&text)
        .map_err(|e| SimulationError::Restart(format!("malformed record for '{}': {e}", pv.name())))?;

    pv.mass = record.mass;
    pv.local.positions = record.positions;
    pv.local.velocities = record.velocities;
    pv.local.ids = record.ids;
    for (name, channel) in record.channels {
        pv.local
            .channels
            .create_channel(&name, channel.data.kind(), channel.persistence, 0)?;
        *pv.local.channels.data_mut(&name)? = channel.data;
    }
    pv.local.align_channels();

    if let Some(object_channels) = record.object_channels {
        let pv_name = pv.name().to_string();
        let info = pv.objects.as_mut().ok_or_else(|| {
            SimulationError::Restart(format!(
                "record for '{}' carries object channels but the vector has no objects",
                pv_name
            ))
        })?;
        for (name, channel) in object_channels {
            info.local
                .create_channel(&name, channel.data.kind(), channel.persistence, 0)?;
            *info.local.data_mut(&name)? = channel.data;
        }
        let n_obj = pv.local_object_count()?;
        let info = pv.objects.as_mut().expect("checked above");
        info.local.resize_all(n_obj);
    }
    pv.bump_motion_stamp();
    tracing::info!(pv = pv.name(), particles = pv.local.len(), "restart record read");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel::channels::DataKind;

    #[test]
    fn pv_checkpoint_roundtrip_is_exact() {
        let folder = std::env::temp_dir().join(format!("ckpt_{}", std::process::id()));
        ensure_folder(&folder).unwrap();

        let mut pv = ParticleVector::new("solvent", 1.5);
        pv.local.channels
            .create_channel("tag", DataKind::Int, Persistence::Persistent, 0)
            .unwrap();
        pv.local.push(Vec3::new(0.1, -0.2, 0.3), Vec3::new(1.0, 2.0, -3.0), 42);
        pv.local.push(Vec3::new(0.4, 0.5, -0.6), Vec3::new(-0.25, 0.0, 0.125), 43);
        pv.local.align_channels();
        if let kernel::ChannelData::Int(v) = pv.local.channels.data_mut("tag").unwrap() {
            v.copy_from_slice(&[7, 9]);
        }

        checkpoint_pv(&pv, 0, &folder).unwrap();

        let mut fresh = ParticleVector::new("solvent", 1.0);
        restart_pv(&mut fresh, 0, &folder).unwrap();
        assert_eq!(fresh.mass, 1.5);
        assert_eq!(fresh.local.positions, pv.local.positions);
        assert_eq!(fresh.local.velocities, pv.local.velocities);
        assert_eq!(fresh.local.ids, pv.local.ids);
        assert_eq!(
            fresh.local.channels.data("tag").unwrap(),
            pv.local.channels.data("tag").unwrap()
        );
        // transient forces channel re-sized to the particle count
        assert_eq!(fresh.local.channels.data("forces").unwrap().len(), 2);

        fs::remove_dir_all(&folder).ok();
    }

    #[test]
    fn missing_record_is_a_restart_error() {
        let folder = std::env::temp_dir().join("no_such_ckpt_folder");
        let mut pv = ParticleVector::new("ghost", 1.0);
        let err = restart_pv(&mut pv, 0, &folder).unwrap_err();
        assert!(matches!(err, SimulationError::Restart(_)));
    }
}
