//! Workstream partitioning over the section dependency graph.
//!
//! Sections and edges are represented as indices into arrays keyed by
//! section id; no pointer graph. Two strategies: one workstream per
//! dependency-met section, or one per weakly-connected component.

use std::collections::{HashMap, HashSet};

use crate::store::Section;
use crate::{Error, Result};

/// A planned workstream: an ordered, dependency-closed set of sections.
#[derive(Debug, Clone)]
pub struct WorkstreamPlan {
    /// Sections in position order.
    pub sections: Vec<Section>,
}

impl WorkstreamPlan {
    /// Section ids in order.
    #[must_use]
    pub fn section_ids(&self) -> Vec<String> {
        self.sections.iter().map(|s| s.id.clone()).collect()
    }
}

/// Partition strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStrategy {
    /// Each dependency-met section becomes its own workstream (default).
    PerSection,
    /// Weakly-connected components of the dependency graph.
    Components,
}

/// One workstream per section whose dependencies are already met.
/// Sections with unmet dependencies wait for a future session.
#[must_use]
pub fn partition_per_section(
    sections: &[Section],
    dependencies_met: &HashSet<String>,
) -> Vec<WorkstreamPlan> {
    let mut ordered: Vec<&Section> = sections
        .iter()
        .filter(|s| !s.skipped && dependencies_met.contains(&s.id))
        .collect();
    ordered.sort_by_key(|s| s.position);
    ordered
        .into_iter()
        .map(|section| WorkstreamPlan {
            sections: vec![section.clone()],
        })
        .collect()
}

/// Group sections into weakly-connected components of the directed
/// dependency graph. Each component is dependency-closed by construction.
/// A cycle anywhere in the graph is a hard fault.
pub fn partition_components(
    sections: &[Section],
    edges: &HashMap<String, Vec<String>>,
) -> Result<Vec<WorkstreamPlan>> {
    detect_cycle(sections, edges)?;

    let index: HashMap<&str, usize> = sections
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    // Undirected adjacency by index.
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); sections.len()];
    for (from, targets) in edges {
        let Some(&from_idx) = index.get(from.as_str()) else {
            continue;
        };
        for to in targets {
            let Some(&to_idx) = index.get(to.as_str()) else {
                continue;
            };
            adjacency[from_idx].push(to_idx);
            adjacency[to_idx].push(from_idx);
        }
    }

    let mut component_of: Vec<Option<usize>> = vec![None; sections.len()];
    let mut components: Vec<Vec<usize>> = Vec::new();
    for start in 0..sections.len() {
        if component_of[start].is_some() {
            continue;
        }
        let id = components.len();
        let mut members = Vec::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if component_of[node].is_some() {
                continue;
            }
            component_of[node] = Some(id);
            members.push(node);
            stack.extend(adjacency[node].iter().copied());
        }
        components.push(members);
    }

    let mut plans: Vec<WorkstreamPlan> = components
        .into_iter()
        .map(|members| {
            let mut members: Vec<Section> =
                members.into_iter().map(|i| sections[i].clone()).collect();
            members.sort_by_key(|s| s.position);
            WorkstreamPlan { sections: members }
        })
        .filter(|plan| plan.sections.iter().any(|s| !s.skipped))
        .collect();
    plans.sort_by_key(|p| p.sections.first().map_or(i64::MAX, |s| s.position));
    Ok(plans)
}

/// Clip plans to the clone budget, preserving section order.
#[must_use]
pub fn clip_to_max(mut plans: Vec<WorkstreamPlan>, max_clones: usize) -> Vec<WorkstreamPlan> {
    plans.truncate(max_clones.max(1));
    plans
}

/// Iterative three-color DFS over the directed edges.
fn detect_cycle(sections: &[Section], edges: &HashMap<String, Vec<String>>) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let index: HashMap<&str, usize> = sections
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();
    let adjacency: Vec<Vec<usize>> = sections
        .iter()
        .map(|s| {
            edges
                .get(&s.id)
                .map(|targets| {
                    targets
                        .iter()
                        .filter_map(|t| index.get(t.as_str()).copied())
                        .collect()
                })
                .unwrap_or_default()
        })
        .collect();

    let mut color = vec![Color::White; sections.len()];
    for root in 0..sections.len() {
        if color[root] != Color::White {
            continue;
        }
        // Stack of (node, next-child cursor).
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        color[root] = Color::Gray;
        while let Some(&(node, cursor)) = stack.last() {
            if cursor < adjacency[node].len() {
                let child = adjacency[node][cursor];
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                match color[child] {
                    Color::Gray => {
                        return Err(Error::CyclicDependency(format!(
                            "sections {} and {} form a cycle",
                            sections[node].name, sections[child].name
                        )));
                    }
                    Color::White => {
                        color[child] = Color::Gray;
                        stack.push((child, 0));
                    }
                    Color::Black => {}
                }
            } else {
                color[node] = Color::Black;
                stack.pop();
            }
        }
    }
    Ok(())
}
