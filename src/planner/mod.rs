//! Execution Planner (C5) — builds ordered phases from work items with
//! dependencies and parallel groups.
//!
//! Grounded in the phase-construction pass of the teacher's
//! `cook::execution::mapreduce` dispatcher, generalized from MapReduce's
//! flat item list into the dependency- and parallel-group-aware algorithm
//! in spec.md §4.5. Cycle handling follows the redesign note in spec.md §9:
//! flush-and-warn, not a hard error, since that is what scenario 3 in §8
//! exercises.

use crate::model::{Complexity, ExecutionPlan, Phase, WorkItem};
use std::collections::{HashMap, HashSet};
use tracing::warn;

const SYNTHETIC_PARALLEL_GROUP: &str = "__parallel__";

/// Build an [`ExecutionPlan`] from a flat set of items. Deterministic for a
/// given input ordering: ties in `execution_order` (including "no order",
/// which sorts last) keep their original relative order.
pub fn plan(items: Vec<WorkItem>) -> ExecutionPlan {
    let total_items = items.len();
    let item_map: HashMap<String, usize> = items
        .iter()
        .enumerate()
        .map(|(i, item)| (item.id.clone(), i))
        .collect();

    // Step 1: stable sort by execution_order ascending, None sorts last.
    let mut ordered: Vec<WorkItem> = items;
    ordered.sort_by_key(|item| (item.execution_order.is_none(), item.execution_order));

    let mut remaining: Vec<WorkItem> = ordered;
    let mut completed: HashSet<String> = HashSet::new();
    let mut phases: Vec<Phase> = Vec::new();
    let mut phase_order: u32 = 1;

    while !remaining.is_empty() {
        let is_ready = |item: &WorkItem| {
            item.dependencies
                .iter()
                .all(|dep| completed.contains(dep) || !item_map.contains_key(dep))
        };

        let (mut ready, mut not_ready): (Vec<WorkItem>, Vec<WorkItem>) =
            remaining.into_iter().partition(is_ready);

        if ready.is_empty() {
            // Cycle or missing in-set dependency: best-effort flush per §9.
            warn!(
                "execution planner: no ready items among {} remaining; flushing all of them \
                 together (cycle or unresolvable intra-plan dependency)",
                not_ready.len()
            );
            ready.append(&mut not_ready);
            not_ready = Vec::new();
        }

        // Step 3c: partition ready items into parallel-group buckets, in
        // first-seen order, preserving the stable sort within each bucket.
        let mut bucket_order: Vec<Option<String>> = Vec::new();
        let mut buckets: HashMap<Option<String>, Vec<WorkItem>> = HashMap::new();

        for item in ready {
            let key = if item.can_parallelize {
                Some(
                    item.parallel_group
                        .clone()
                        .unwrap_or_else(|| SYNTHETIC_PARALLEL_GROUP.to_string()),
                )
            } else {
                None
            };

            if !buckets.contains_key(&key) {
                bucket_order.push(key.clone());
            }
            buckets.entry(key).or_default().push(item);
        }

        // Singleton (non-parallelizable) items each get their own phase, so
        // split the `None` bucket back into one-item phases while keeping
        // parallel buckets intact.
        for key in bucket_order {
            let bucket = buckets.remove(&key).unwrap();
            if key.is_none() {
                for item in bucket {
                    completed.insert(item.id.clone());
                    phases.push(single_item_phase(phase_order, item));
                    phase_order += 1;
                }
            } else {
                for item in &bucket {
                    completed.insert(item.id.clone());
                }
                let can_run_in_parallel = bucket.len() >= 2;
                let estimated_complexity = max_complexity(&bucket);
                phases.push(Phase {
                    order: phase_order,
                    items: bucket,
                    can_run_in_parallel,
                    estimated_complexity,
                });
                phase_order += 1;
            }
        }

        remaining = not_ready;
    }

    ExecutionPlan {
        phases,
        total_items,
    }
}

fn single_item_phase(order: u32, item: WorkItem) -> Phase {
    let estimated_complexity = item.estimated_complexity;
    Phase {
        order,
        items: vec![item],
        can_run_in_parallel: false,
        estimated_complexity,
    }
}

fn max_complexity(items: &[WorkItem]) -> Option<Complexity> {
    items.iter().filter_map(|i| i.estimated_complexity).max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkItemType;

    fn item(id: &str) -> WorkItem {
        WorkItem::new(id, format!("ENG-{id}"), WorkItemType::Task)
    }

    #[test]
    fn empty_dependencies_land_in_phase_one() {
        let plan = plan(vec![item("a"), item("b")]);
        assert_eq!(plan.phases.len(), 2);
        assert_eq!(plan.phases[0].order, 1);
        assert_eq!(plan.phases[1].order, 2);
    }

    #[test]
    fn dependency_outside_plan_is_satisfied() {
        let a = item("a").depends_on(["outside"]);
        let plan = plan(vec![a]);
        assert_eq!(plan.phases.len(), 1);
        assert_eq!(plan.phases[0].order, 1);
    }

    #[test]
    fn three_phase_topology_matches_scenario_2() {
        let a = item("a").order(1);
        let b = item("b")
            .depends_on(["a"])
            .parallelizable(Some("p"));
        let c = item("c")
            .depends_on(["a"])
            .parallelizable(Some("p"));
        let d = item("d").depends_on(["b", "c"]);

        let result = plan(vec![a, b, c, d]);
        assert_eq!(result.phases.len(), 3);
        assert_eq!(result.phases[0].items.len(), 1);
        assert_eq!(result.phases[0].items[0].id, "a");

        assert_eq!(result.phases[1].items.len(), 2);
        assert!(result.phases[1].can_run_in_parallel);
        let ids: HashSet<_> = result.phases[1].items.iter().map(|i| i.id.clone()).collect();
        assert!(ids.contains("b") && ids.contains("c"));

        assert_eq!(result.phases[2].items.len(), 1);
        assert_eq!(result.phases[2].items[0].id, "d");
    }

    #[test]
    fn phase_of_dependency_precedes_phase_of_dependent() {
        let a = item("a");
        let b = item("b").depends_on(["a"]);
        let c = item("c").depends_on(["b"]);
        let result = plan(vec![c, a, b]);

        let phase_of = |id: &str| {
            result
                .phases
                .iter()
                .find(|p| p.items.iter().any(|i| i.id == id))
                .unwrap()
                .order
        };
        assert!(phase_of("a") < phase_of("b"));
        assert!(phase_of("b") < phase_of("c"));
    }

    #[test]
    fn cycle_flushes_both_items_with_no_infinite_loop() {
        let x = item("x").depends_on(["y"]);
        let y = item("y").depends_on(["x"]);
        let result = plan(vec![x, y]);

        let ids: HashSet<_> = result
            .phases
            .iter()
            .flat_map(|p| p.items.iter().map(|i| i.id.clone()))
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("x") && ids.contains("y"));
    }

    #[test]
    fn flatten_equals_input_set() {
        let items = vec![item("a"), item("b").depends_on(["a"]), item("c")];
        let ids: HashSet<_> = items.iter().map(|i| i.id.clone()).collect();
        let result = plan(items);
        let flattened: HashSet<_> = result.flatten_ids().into_iter().map(String::from).collect();
        assert_eq!(ids, flattened);
    }

    #[test]
    fn singleton_items_never_report_parallel() {
        let a = item("a");
        let b = item("b");
        let result = plan(vec![a, b]);
        for phase in &result.phases {
            assert!(!phase.can_run_in_parallel);
        }
    }

    #[test]
    fn single_member_parallel_group_is_not_marked_parallel() {
        let a = item("a").parallelizable(Some("p"));
        let result = plan(vec![a]);
        assert_eq!(result.phases.len(), 1);
        assert!(!result.phases[0].can_run_in_parallel);
    }

    #[test]
    fn phase_complexity_is_max_of_members() {
        let a = item("a")
            .parallelizable(Some("p"))
            .complexity(Complexity::Simple);
        let b = item("b")
            .parallelizable(Some("p"))
            .complexity(Complexity::Complex);
        let result = plan(vec![a, b]);
        assert_eq!(result.phases[0].estimated_complexity, Some(Complexity::Complex));
    }

    #[test]
    fn nil_group_parallelizable_items_share_synthetic_bucket() {
        let a = item("a").parallelizable(None::<String>);
        let b = item("b").parallelizable(None::<String>);
        let result = plan(vec![a, b]);
        // both land in the synthetic "__parallel__" bucket together.
        assert_eq!(result.phases.len(), 1);
        assert!(result.phases[0].can_run_in_parallel);
    }

    #[test]
    fn execution_order_ties_broken_by_stable_input_order() {
        let a = item("a").order(1);
        let b = item("b").order(1);
        let result = plan(vec![a, b]);
        assert_eq!(result.phases[0].items[0].id, "a");
        assert_eq!(result.phases[1].items[0].id, "b");
    }
}
