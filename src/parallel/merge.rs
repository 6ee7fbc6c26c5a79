use crate::parallel::scheduler::TaskGraph;
use crate::tracker::Task;

/// Order in which completed task branches are merged.
///
/// Dependencies inside the batch merge before their dependents. Otherwise
/// shared/infrastructure work (any label in `shared_labels`) goes first, then
/// ties break on task id so the order never depends on completion timing.
pub fn merge_order(graph: &TaskGraph, tasks: &[Task], shared_labels: &[String]) -> Vec<Task> {
    let mut ordered: Vec<Task> = tasks.to_vec();
    ordered.sort_by_cached_key(|task| {
        let shared = shared_labels.iter().any(|l| task.has_label(l));
        (graph.depth(&task.id), !shared, task.id.clone())
    });
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(tasks: &[Task]) -> Vec<&str> {
        tasks.iter().map(|t| t.id.as_str()).collect()
    }

    fn shared() -> Vec<String> {
        vec!["infra".to_string(), "shared".to_string()]
    }

    #[test]
    fn test_shared_before_feature_then_by_id() {
        let tasks = vec![
            Task::new("c", "feature c"),
            Task::new("b", "config loader").with_labels(&["Infra"]),
            Task::new("a", "feature a"),
        ];
        let graph = TaskGraph::build(tasks.clone()).unwrap();
        let order = merge_order(&graph, &tasks, &shared());
        assert_eq!(ids(&order), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_dependencies_merge_first() {
        let tasks = vec![
            Task::new("a", "uses logger").with_blocked_by(&["z"]),
            Task::new("z", "logger"),
            Task::new("m", "shared types").with_labels(&["shared"]),
        ];
        let graph = TaskGraph::build(tasks.clone()).unwrap();
        let order = merge_order(&graph, &tasks, &shared());
        assert_eq!(ids(&order), vec!["m", "z", "a"]);
    }

    #[test]
    fn test_order_is_independent_of_input_order() {
        let tasks = vec![Task::new("2", "two"), Task::new("1", "one"), Task::new("3", "three")];
        let graph = TaskGraph::build(tasks.clone()).unwrap();
        let mut reversed = tasks.clone();
        reversed.reverse();
        assert_eq!(
            ids(&merge_order(&graph, &tasks, &[])),
            ids(&merge_order(&graph, &reversed, &[]))
        );
    }
}
