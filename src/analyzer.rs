use std::cmp::Reverse;
use std::collections::BinaryHeap;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::handle::{RenderPassHandle, ResourceHandle};
use crate::pass::RenderPass;
use crate::resource::{ResourceLifetime, VirtualResource};
use crate::state::ResourceState;

/// A derived producer→consumer edge for one resource.
#[derive(Debug, Clone)]
pub struct Dependency {
    pub producer: RenderPassHandle,
    pub consumer: RenderPassHandle,
    pub resource: ResourceHandle,
    pub before: ResourceState,
    pub after: ResourceState,
}

#[derive(Debug, Default)]
pub struct AnalysisResult {
    pub execution_order: Vec<RenderPassHandle>,
    pub dependencies: Vec<Dependency>,
    pub unused_resources: Vec<ResourceHandle>,
    pub has_cycles: bool,
}

/// Transient resources proven to have disjoint lifetimes and identical
/// descriptions; the whole group shares one physical allocation.
#[derive(Debug, Clone)]
pub struct ResourceAliasGroup {
    pub members: Vec<ResourceHandle>,
    pub byte_size: u64,
}

pub struct GraphAnalyzer;

impl GraphAnalyzer {
    /// Populates `first_use`/`last_use` and the reader/writer lists from
    /// declared usages, scanning passes in insertion order. Previous
    /// analysis results are discarded first.
    pub fn compute_resource_lifetimes(passes: &[RenderPass], resources: &mut [VirtualResource]) {
        for resource in resources.iter_mut() {
            resource.reset_analysis();
        }
        for (pass_index, pass) in passes.iter().enumerate() {
            for usage in &pass.usages {
                let Some(resource) = resources.get_mut(usage.resource.index()) else {
                    continue;
                };
                match resource.lifetime.as_mut() {
                    Some(lifetime) => {
                        lifetime.first_use = lifetime.first_use.min(pass_index);
                        lifetime.last_use = lifetime.last_use.max(pass_index);
                    }
                    None => {
                        resource.lifetime = Some(ResourceLifetime {
                            first_use: pass_index,
                            last_use: pass_index,
                        });
                    }
                }
                if usage.write {
                    resource.writers.push(pass.handle);
                } else {
                    resource.readers.push(pass.handle);
                }
            }
        }
    }

    /// Builds the dependency graph, rejects cycles and produces a
    /// deterministic topological execution order. Requires lifetimes to
    /// have been computed.
    pub fn analyze_graph(passes: &[RenderPass], resources: &[VirtualResource]) -> AnalysisResult {
        let (graph, dependencies) = Self::build_dependency_graph(passes, resources);

        let unused_resources = resources
            .iter()
            .filter(|resource| resource.lifetime.is_none())
            .map(|resource| resource.handle)
            .collect();

        if Self::detect_cycles(&graph) {
            return AnalysisResult {
                execution_order: Vec::new(),
                dependencies,
                unused_resources,
                has_cycles: true,
            };
        }

        let execution_order = Self::topological_sort(&graph);
        if execution_order.len() < passes.len() {
            // A cycle the DFS missed still shows up as an incomplete sort.
            return AnalysisResult {
                execution_order: Vec::new(),
                dependencies,
                unused_resources,
                has_cycles: true,
            };
        }

        AnalysisResult {
            execution_order,
            dependencies,
            unused_resources,
            has_cycles: false,
        }
    }

    /// Groups transient, non-imported resources whose lifetimes never
    /// overlap and whose descriptions match exactly. Every transient
    /// resource lands in some group (a singleton if nothing aliases) so
    /// allocation is uniform. Pairwise only: disjoint triples that an
    /// interval coloring would merge are left in separate groups.
    pub fn analyze_resource_aliasing(resources: &[VirtualResource]) -> Vec<ResourceAliasGroup> {
        let mut groups: Vec<ResourceAliasGroup> = Vec::new();
        let mut representatives: Vec<&VirtualResource> = Vec::new();
        let mut member_lifetimes: Vec<Vec<ResourceLifetime>> = Vec::new();

        for resource in resources {
            if !resource.transient || resource.imported {
                continue;
            }
            let Some(lifetime) = resource.lifetime else {
                continue;
            };

            let mut placed = false;
            for (group_index, group) in groups.iter_mut().enumerate() {
                if representatives[group_index].description != resource.description {
                    continue;
                }
                if member_lifetimes[group_index]
                    .iter()
                    .all(|other| lifetime.disjoint(other))
                {
                    group.members.push(resource.handle);
                    member_lifetimes[group_index].push(lifetime);
                    placed = true;
                    break;
                }
            }
            if !placed {
                groups.push(ResourceAliasGroup {
                    members: vec![resource.handle],
                    byte_size: resource.description.byte_size(),
                });
                representatives.push(resource);
                member_lifetimes.push(vec![lifetime]);
            }
        }

        groups
    }

    fn build_dependency_graph(
        passes: &[RenderPass],
        resources: &[VirtualResource],
    ) -> (DiGraph<RenderPassHandle, ResourceHandle>, Vec<Dependency>) {
        let mut graph = DiGraph::new();
        for pass in passes {
            graph.add_node(pass.handle);
        }

        let mut dependencies = Vec::new();
        for resource in resources {
            let Some(lifetime) = resource.lifetime else {
                continue;
            };

            // First writer inside the use range is the producer. A resource
            // with no writer is assumed pre-initialized (e.g. imported) and
            // contributes no edges.
            let producer = (lifetime.first_use..=lifetime.last_use).find(|&pass_index| {
                passes[pass_index]
                    .usages
                    .iter()
                    .any(|usage| usage.resource == resource.handle && usage.write)
            });
            let Some(producer_index) = producer else {
                continue;
            };
            let producer_state = passes[producer_index]
                .usages
                .iter()
                .find(|usage| usage.resource == resource.handle && usage.write)
                .map(|usage| usage.required_state())
                .unwrap_or_default();

            for consumer_index in lifetime.first_use..=lifetime.last_use {
                if consumer_index == producer_index {
                    continue;
                }
                let consumer_usage = passes[consumer_index]
                    .usages
                    .iter()
                    .find(|usage| usage.resource == resource.handle);
                let Some(consumer_usage) = consumer_usage else {
                    continue;
                };
                let from = NodeIndex::new(producer_index);
                let to = NodeIndex::new(consumer_index);
                if !graph.contains_edge(from, to) {
                    graph.add_edge(from, to, resource.handle);
                }
                dependencies.push(Dependency {
                    producer: passes[producer_index].handle,
                    consumer: passes[consumer_index].handle,
                    resource: resource.handle,
                    before: producer_state,
                    after: consumer_usage.required_state(),
                });
            }
        }

        (graph, dependencies)
    }

    /// Iterative DFS with a recursion-stack marker; a back-edge to a node
    /// still on the stack is a cycle.
    fn detect_cycles(graph: &DiGraph<RenderPassHandle, ResourceHandle>) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; graph.node_count()];
        for start in graph.node_indices() {
            if marks[start.index()] != Mark::Unvisited {
                continue;
            }
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> = vec![(
                start,
                graph.neighbors_directed(start, Direction::Outgoing).collect(),
            )];
            marks[start.index()] = Mark::OnStack;
            while let Some((node, pending)) = stack.last_mut() {
                match pending.pop() {
                    Some(next) => match marks[next.index()] {
                        Mark::OnStack => return true,
                        Mark::Done => {}
                        Mark::Unvisited => {
                            marks[next.index()] = Mark::OnStack;
                            let neighbors = graph
                                .neighbors_directed(next, Direction::Outgoing)
                                .collect();
                            stack.push((next, neighbors));
                        }
                    },
                    None => {
                        marks[node.index()] = Mark::Done;
                        stack.pop();
                    }
                }
            }
        }
        false
    }

    /// Kahn's algorithm. Ties among zero-in-degree nodes break by
    /// ascending insertion index so compilation is reproducible.
    fn topological_sort(
        graph: &DiGraph<RenderPassHandle, ResourceHandle>,
    ) -> Vec<RenderPassHandle> {
        let mut in_degree: Vec<usize> = graph
            .node_indices()
            .map(|node| {
                graph
                    .neighbors_directed(node, Direction::Incoming)
                    .count()
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = graph
            .node_indices()
            .filter(|node| in_degree[node.index()] == 0)
            .map(|node| Reverse(node.index()))
            .collect();

        let mut order = Vec::with_capacity(graph.node_count());
        while let Some(Reverse(index)) = ready.pop() {
            let node = NodeIndex::new(index);
            order.push(graph[node]);
            for next in graph.neighbors_directed(node, Direction::Outgoing) {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    ready.push(Reverse(next.index()));
                }
            }
        }
        order
    }
}
