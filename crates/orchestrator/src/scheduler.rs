//! Dependency-driven task scheduler.
//!
//! A static DAG of named tasks is built once after registration and reused
//! every step. Compilation topologically orders the tasks; among tasks whose
//! dependencies are simultaneously satisfied, high-priority tasks go first
//! and ties break on task id, so traces are identical across runs on the
//! same input.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::Path;

use kernel::error::{Result, SimulationError};

/// Handle to one task.
pub type TaskId = usize;

struct Task<P> {
    label: String,
    payloads: Vec<P>,
    every: u64,
    high_priority: bool,
}

/// Scheduler generic over the payload describing one unit of work.
pub struct TaskScheduler<P> {
    tasks: Vec<Task<P>>,
    /// `edges[u]` holds every v that must run after u.
    edges: Vec<BTreeSet<TaskId>>,
    plan: Option<Vec<TaskId>>,
}

impl<P> Default for TaskScheduler<P> {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            edges: Vec::new(),
            plan: None,
        }
    }
}

impl<P: Clone> TaskScheduler<P> {
    /// Empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a named task; runs every step unless restridden.
    pub fn create_task(&mut self, label: &str) -> TaskId {
        self.tasks.push(Task {
            label: label.to_string(),
            payloads: Vec::new(),
            every: 1,
            high_priority: false,
        });
        self.edges.push(BTreeSet::new());
        self.plan = None;
        self.tasks.len() - 1
    }

    /// Append a unit of work to a task (units run in insertion order).
    pub fn add_task(&mut self, id: TaskId, payload: P) {
        self.tasks[id].payloads.push(payload);
    }

    /// Run the task only when `step % every == 0` (`every == 0` disables it).
    pub fn set_every(&mut self, id: TaskId, every: u64) {
        self.tasks[id].every = every;
    }

    /// Prefer this task among simultaneously ready ones (used on halo
    /// pack/unpack and force clears so network latency hides behind interior
    /// work).
    pub fn set_high_priority(&mut self, id: TaskId) {
        self.tasks[id].high_priority = true;
    }

    /// Two-sided dependency declaration: every task in `before` runs after
    /// `id`; every task in `after` runs before `id`.
    pub fn add_dependency(&mut self, id: TaskId, before: &[TaskId], after: &[TaskId]) {
        for &b in before {
            self.edges[id].insert(b);
        }
        for &a in after {
            self.edges[a].insert(id);
        }
        self.plan = None;
    }

    /// Task label.
    pub fn label(&self, id: TaskId) -> &str {
        &self.tasks[id].label
    }

    /// Topologically order the graph into an execution plan.
    pub fn compile(&mut self) -> Result<()> {
        let n = self.tasks.len();
        let mut indegree = vec![0usize; n];
        for succs in &self.edges {
            for &v in succs {
                indegree[v] += 1;
            }
        }

        // ready set ordered by (normal-after-high, id)
        let mut ready: BTreeSet<(u8, TaskId)> = (0..n)
            .filter(|&v| indegree[v] == 0)
            .map(|v| (self.rank(v), v))
            .collect();

        let mut plan = Vec::with_capacity(n);
        while let Some(&(rank, v)) = ready.iter().next() {
            ready.remove(&(rank, v));
            plan.push(v);
            for &w in &self.edges[v] {
                indegree[w] -= 1;
                if indegree[w] == 0 {
                    ready.insert((self.rank(w), w));
                }
            }
        }

        if plan.len() != n {
            let stuck: Vec<&str> = (0..n)
                .filter(|&v| indegree[v] > 0)
                .map(|v| self.tasks[v].label.as_str())
                .collect();
            return Err(SimulationError::Invariant(format!(
                "task graph has a cycle involving: {}",
                stuck.join(", ")
            )));
        }
        tracing::debug!(tasks = n, "task graph compiled");
        self.plan = Some(plan);
        Ok(())
    }

    fn rank(&self, id: TaskId) -> u8 {
        u8::from(!self.tasks[id].high_priority)
    }

    /// Whether a task is due at `step`.
    pub fn is_due(&self, id: TaskId, step: u64) -> bool {
        let every = self.tasks[id].every;
        every > 0 && step % every == 0
    }

    /// The due tasks of `step` in execution order, with their work units.
    pub fn collect_due(&self, step: u64) -> Result<Vec<(TaskId, Vec<P>)>> {
        let plan = self.plan.as_ref().ok_or_else(|| {
            SimulationError::Invariant("scheduler used before compile()".into())
        })?;
        Ok(plan
            .iter()
            .filter(|&&id| self.is_due(id, step))
            .map(|&id| (id, self.tasks[id].payloads.clone()))
            .collect())
    }

    /// Execute one step: every due task in dependency order. The first error
    /// aborts the step.
    pub fn run(&self, step: u64, mut exec: impl FnMut(&str, &P) -> Result<()>) -> Result<()> {
        for (id, payloads) in self.collect_due(step)? {
            for p in &payloads {
                exec(self.label(id), p)?;
            }
        }
        Ok(())
    }

    /// Run one task unconditionally (boot-time initialisation).
    pub fn force_exec(&self, id: TaskId, mut exec: impl FnMut(&str, &P) -> Result<()>) -> Result<()> {
        for p in &self.tasks[id].payloads {
            exec(self.label(id), p)?;
        }
        Ok(())
    }

    /// Work units of one task, cloned (the driver dispatches on them while
    /// mutating itself).
    pub fn payloads(&self, id: TaskId) -> Vec<P> {
        self.tasks[id].payloads.clone()
    }

    /// Export the dependency graph for inspection.
    pub fn save_dependency_graph_graphml(&self, path: &Path) -> Result<()> {
        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str("<graphml xmlns=\"http://graphml.graphdrawing.org/xmlns\">\n");
        xml.push_str("  <key id=\"label\" for=\"node\" attr.name=\"label\" attr.type=\"string\"/>\n");
        xml.push_str("  <graph id=\"tasks\" edgedefault=\"directed\">\n");
        for (id, task) in self.tasks.iter().enumerate() {
            let _ = writeln!(
                xml,
                "    <node id=\"n{id}\"><data key=\"label\">{}</data></node>",
                task.label
            );
        }
        for (u, succs) in self.edges.iter().enumerate() {
            for &v in succs {
                let _ = writeln!(xml, "    <edge source=\"n{u}\" target=\"n{v}\"/>");
            }
        }
        xml.push_str("  </graph>\n</graphml>\n");
        std::fs::write(path, xml)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn collect_order(s: &TaskScheduler<&'static str>, step: u64) -> Vec<&'static str> {
        let seen = RefCell::new(Vec::new());
        s.run(step, |_, p| {
            seen.borrow_mut().push(*p);
            Ok(())
        })
        .unwrap();
        seen.into_inner()
    }

    #[test]
    fn topological_order_respects_both_edge_directions() {
        let mut s = TaskScheduler::new();
        let a = s.create_task("a");
        let b = s.create_task("b");
        let c = s.create_task("c");
        s.add_task(a, "a");
        s.add_task(b, "b");
        s.add_task(c, "c");
        // a before b; c after... b must complete before c, a before b
        s.add_dependency(b, &[c], &[a]);
        s.compile().unwrap();
        assert_eq!(collect_order(&s, 0), vec!["a", "b", "c"]);
    }

    #[test]
    fn priority_breaks_ties_then_id() {
        let mut s = TaskScheduler::new();
        let a = s.create_task("a");
        let b = s.create_task("b");
        let c = s.create_task("c");
        s.add_task(a, "a");
        s.add_task(b, "b");
        s.add_task(c, "c");
        s.set_high_priority(c);
        s.compile().unwrap();
        assert_eq!(collect_order(&s, 0), vec!["c", "a", "b"]);
    }

    #[test]
    fn strides_skip_off_steps() {
        let mut s = TaskScheduler::new();
        let a = s.create_task("a");
        let b = s.create_task("b");
        s.add_task(a, "a");
        s.add_task(b, "b");
        s.set_every(b, 3);
        s.compile().unwrap();
        assert_eq!(collect_order(&s, 0), vec!["a", "b"]);
        assert_eq!(collect_order(&s, 1), vec!["a"]);
        assert_eq!(collect_order(&s, 3), vec!["a", "b"]);
        // every == 0 disables entirely
        let mut s2 = TaskScheduler::new();
        let z = s2.create_task("z");
        s2.add_task(z, "z");
        s2.set_every(z, 0);
        s2.compile().unwrap();
        assert!(collect_order(&s2, 0).is_empty());
    }

    #[test]
    fn cycles_fail_to_compile() {
        let mut s: TaskScheduler<&str> = TaskScheduler::new();
        let a = s.create_task("a");
        let b = s.create_task("b");
        s.add_dependency(a, &[b], &[]);
        s.add_dependency(b, &[a], &[]);
        let err = s.compile().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn compile_is_deterministic() {
        let build = || {
            let mut s = TaskScheduler::new();
            for i in 0..20 {
                let t = s.create_task(&format!("t{i}"));
                s.add_task(t, "x");
            }
            s.add_dependency(5, &[1, 2], &[9]);
            s.add_dependency(12, &[3], &[8, 15]);
            s.set_high_priority(17);
            s.compile().unwrap();
            s.collect_due(0).unwrap().iter().map(|(id, _)| *id).collect::<Vec<_>>()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn graphml_export_lists_nodes_and_edges() {
        let mut s: TaskScheduler<&str> = TaskScheduler::new();
        let a = s.create_task("build cells");
        let b = s.create_task("forces");
        s.add_dependency(a, &[b], &[]);
        let path = std::env::temp_dir().join(format!("graph_{}.graphml", std::process::id()));
        s.save_dependency_graph_graphml(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("build cells"));
        assert!(text.contains("<edge source=\"n0\" target=\"n1\"/>"));
        std::fs::remove_file(&path).ok();
    }
}
