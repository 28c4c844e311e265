use crate::error::{EngineError, EngineResult, ValidationError};
use crate::types::*;
use anyhow::anyhow;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// DAG of a project's steps. Edges point from a dependency to its dependent.
pub struct StepGraph {
    graph: DiGraph<StepNumber, Dependency>,
    step_indices: HashMap<StepNumber, NodeIndex>,
}

impl StepGraph {
    /// Build and validate the graph for a set of step numbers and edges
    pub fn build(
        step_numbers: impl IntoIterator<Item = StepNumber>,
        dependencies: &[Dependency],
    ) -> Result<Self, ValidationError> {
        let mut graph = DiGraph::new();
        let mut step_indices = HashMap::new();

        for number in step_numbers {
            if step_indices.contains_key(&number) {
                return Err(ValidationError::DuplicateStep(number));
            }
            let node = graph.add_node(number);
            step_indices.insert(number, node);
        }

        let mut seen = HashSet::new();
        for dep in dependencies {
            if dep.step_number == dep.depends_on {
                return Err(ValidationError::SelfDependency(dep.step_number));
            }
            if !seen.insert((dep.step_number, dep.depends_on)) {
                return Err(ValidationError::DuplicateDependency {
                    step: dep.step_number,
                    depends_on: dep.depends_on,
                });
            }

            let step_idx = step_indices.get(&dep.step_number).ok_or(
                ValidationError::MissingDependency {
                    step: dep.step_number,
                    depends_on: dep.depends_on,
                },
            )?;
            let dep_idx = step_indices.get(&dep.depends_on).ok_or(
                ValidationError::MissingDependency {
                    step: dep.step_number,
                    depends_on: dep.depends_on,
                },
            )?;

            graph.add_edge(*dep_idx, *step_idx, dep.clone());
        }

        let required = graph.filter_map(
            |_, number| Some(*number),
            |_, dep| (dep.dependency_type != DependencyType::Optional).then_some(()),
        );
        if let Err(cycle) = toposort(&required, None) {
            return Err(ValidationError::CyclicDependency(required[cycle.node_id()]));
        }
        // An optional cycle would wait on itself forever
        if let Err(cycle) = toposort(&graph, None) {
            return Err(ValidationError::OptionalCycle(graph[cycle.node_id()]));
        }

        Ok(Self {
            graph,
            step_indices,
        })
    }

    /// Incoming edges of a step, ordered by the dependency's number
    pub fn dependencies(&self, step: StepNumber) -> Vec<Dependency> {
        self.edges(step, Direction::Incoming)
    }

    /// Outgoing edges of a step, ordered by the dependent's number
    pub fn dependents(&self, step: StepNumber) -> Vec<Dependency> {
        self.edges(step, Direction::Outgoing)
    }

    fn edges(&self, step: StepNumber, direction: Direction) -> Vec<Dependency> {
        let Some(node) = self.step_indices.get(&step) else {
            return Vec::new();
        };

        let mut edges: Vec<Dependency> = self
            .graph
            .edges_directed(*node, direction)
            .map(|edge| edge.weight().clone())
            .collect();
        edges.sort_by_key(|d| (d.depends_on, d.step_number));
        edges
    }
}

/// Check a creation request and resolve its inline dependencies into edges
pub fn validate_plan(request: &NewProject) -> Result<(StepGraph, Vec<Dependency>), ValidationError> {
    if request.name.trim().is_empty() {
        return Err(ValidationError::InvalidField {
            field: "name",
            reason: "must not be empty".to_string(),
        });
    }
    if request.project_type.trim().is_empty() {
        return Err(ValidationError::InvalidField {
            field: "projectType",
            reason: "must not be empty".to_string(),
        });
    }
    if request.steps.is_empty() {
        return Err(ValidationError::EmptyPlan);
    }

    let mut dependencies = Vec::new();
    for step in &request.steps {
        if step.goal.trim().is_empty() {
            return Err(ValidationError::InvalidField {
                field: "goal",
                reason: format!("step {} has an empty goal", step.step_number),
            });
        }
        dependencies.extend(
            step.dependencies
                .iter()
                .map(|spec| spec.to_dependency(step.step_number)),
        );
    }

    let graph = StepGraph::build(request.steps.iter().map(|s| s.step_number), &dependencies)?;
    Ok((graph, dependencies))
}

/// A project's persisted state, loaded as one unit for a transition
#[derive(Debug, Clone)]
pub struct ProjectGraph {
    pub project: Project,
    /// Ordered by step number
    pub steps: Vec<Step>,
    pub dependencies: Vec<Dependency>,
}

impl ProjectGraph {
    pub fn step(&self, number: StepNumber) -> Option<&Step> {
        self.steps
            .binary_search_by_key(&number, |s| s.step_number)
            .ok()
            .map(|i| &self.steps[i])
    }

    pub fn step_mut(&mut self, number: StepNumber) -> EngineResult<&mut Step> {
        let project_id = self.project.id;
        match self.steps.binary_search_by_key(&number, |s| s.step_number) {
            Ok(i) => Ok(&mut self.steps[i]),
            Err(_) => Err(EngineError::NotFound(format!(
                "Step {} of project {}",
                number, project_id
            ))),
        }
    }

    /// Incoming edges of a step
    pub fn dependencies_of(&self, number: StepNumber) -> impl Iterator<Item = &Dependency> {
        self.dependencies
            .iter()
            .filter(move |d| d.step_number == number)
    }

    /// Rebuild the DAG; stored graphs were validated at creation
    pub fn dag(&self) -> EngineResult<StepGraph> {
        StepGraph::build(self.steps.iter().map(|s| s.step_number), &self.dependencies).map_err(
            |e| {
                EngineError::Storage(anyhow!(
                    "Stored graph of project {} is invalid: {}",
                    self.project.id,
                    e
                ))
            },
        )
    }

    /// Node view with both adjacency directions precomputed
    pub fn view(&self) -> EngineResult<GraphView> {
        let dag = self.dag()?;
        let nodes = self
            .steps
            .iter()
            .map(|step| GraphNode {
                step_number: step.step_number,
                step_id: step.id,
                goal: step.goal.clone(),
                action: step.action,
                status: step.status,
                dependencies: dag
                    .dependencies(step.step_number)
                    .iter()
                    .map(|d| d.depends_on)
                    .collect(),
                dependents: dag
                    .dependents(step.step_number)
                    .iter()
                    .map(|d| d.step_number)
                    .collect(),
            })
            .collect();

        Ok(GraphView {
            project_id: self.project.id,
            status: self.project.status,
            nodes,
        })
    }

    pub fn into_detail(self) -> ProjectDetail {
        ProjectDetail {
            project: self.project,
            steps: self.steps,
            dependencies: self.dependencies,
        }
    }
}
