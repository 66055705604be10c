//! Fragment mapping: the 27 neighbour slots of a subdomain.
//!
//! Each slot encodes a direction over `{-1, 0, 1}^3` in base 3; slot 26 is
//! the `(0, 0, 0)` self fragment ("bulk"). Every exchange message is
//! associated with one fragment.

use glam::IVec3;

/// Number of fragments (26 neighbours + bulk).
pub const NUM_FRAGMENTS: usize = 27;

/// The self fragment.
pub const BULK_ID: usize = 26;

/// Fragment id of a direction.
#[inline]
pub fn id(dir: IVec3) -> usize {
    (((dir.x + 2) % 3) + 3 * ((dir.y + 2) % 3) + 9 * ((dir.z + 2) % 3)) as usize
}

/// Direction of a fragment id.
#[inline]
pub fn dir(id: usize) -> IVec3 {
    let id = id as i32;
    IVec3::new((id + 2) % 3 - 1, (id / 3 + 2) % 3 - 1, (id / 9 + 2) % 3 - 1)
}

/// Fragment of the opposite direction.
#[inline]
pub fn mirror(fragment: usize) -> usize {
    id(-dir(fragment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_is_the_zero_direction() {
        assert_eq!(id(IVec3::ZERO), BULK_ID);
        assert_eq!(dir(BULK_ID), IVec3::ZERO);
    }

    #[test]
    fn id_dir_roundtrip_covers_all_fragments() {
        let mut seen = [false; NUM_FRAGMENTS];
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    let d = IVec3::new(dx, dy, dz);
                    let f = id(d);
                    assert_eq!(dir(f), d);
                    seen[f] = true;
                }
            }
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn mirror_is_involutive() {
        for f in 0..NUM_FRAGMENTS {
            assert_eq!(mirror(mirror(f)), f);
        }
        assert_eq!(mirror(BULK_ID), BULK_ID);
    }
}
