use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A unit of work handed to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Agents of this type score higher during selection.
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub input: Value,
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            capabilities: vec![],
            agent_type: None,
            input: Value::Null,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAnalysis {
    pub complexity: Complexity,
    pub required_skills: Vec<String>,
    pub estimated_steps: usize,
}

impl TaskAnalysis {
    /// Score a task by description length and capability count.
    pub fn analyze(task: &Task) -> Self {
        let mut skills: Vec<String> = Vec::new();
        for cap in &task.capabilities {
            if !skills.contains(cap) {
                skills.push(cap.clone());
            }
        }
        let words = task.description.split_whitespace().count();
        let score = words / 20 + skills.len();
        let complexity = match score {
            0..=1 => Complexity::Low,
            2..=3 => Complexity::Medium,
            _ => Complexity::High,
        };
        Self {
            complexity,
            estimated_steps: skills.len().max(1),
            required_skills: skills,
        }
    }
}

/// One node of an execution plan. Leaves are dispatched to agents;
/// composites aggregate their children's results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub capability: Option<String>,
    #[serde(default)]
    pub children: Vec<PlanStep>,
    /// Children may run concurrently.
    #[serde(default)]
    pub parallel: bool,
}

impl PlanStep {
    pub fn leaf(id: impl Into<String>, description: impl Into<String>, capability: Option<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            capability,
            children: vec![],
            parallel: false,
        }
    }

    pub fn composite(id: impl Into<String>, description: impl Into<String>, children: Vec<PlanStep>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            capability: None,
            children,
            parallel: true,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Leaf steps in depth-first order.
    pub fn leaves(&self) -> Vec<&PlanStep> {
        if self.is_leaf() {
            return vec![self];
        }
        self.children.iter().flat_map(|c| c.leaves()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTree {
    pub root: PlanStep,
}

impl ExecutionTree {
    /// One leaf per required skill under a composite root. A task with no
    /// skills becomes a single general-purpose leaf.
    pub fn build(task: &Task, analysis: &TaskAnalysis) -> Self {
        let children = if analysis.required_skills.is_empty() {
            vec![PlanStep::leaf("step-1", task.description.clone(), None)]
        } else {
            analysis
                .required_skills
                .iter()
                .enumerate()
                .map(|(i, skill)| {
                    PlanStep::leaf(
                        format!("step-{}", i + 1),
                        format!("{} ({})", task.description, skill),
                        Some(skill.clone()),
                    )
                })
                .collect()
        };
        Self {
            root: PlanStep::composite("root", task.description.clone(), children),
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.root.leaves().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_scales_with_capabilities() {
        let small = TaskAnalysis::analyze(&Task::new("summarize").with_capability("summarize"));
        assert_eq!(small.complexity, Complexity::Low);
        assert_eq!(small.estimated_steps, 1);

        let big = TaskAnalysis::analyze(
            &Task::new("research and report")
                .with_capability("search")
                .with_capability("summarize")
                .with_capability("write")
                .with_capability("review")
                .with_capability("search"),
        );
        assert_eq!(big.required_skills, vec!["search", "summarize", "write", "review"]);
        assert_eq!(big.complexity, Complexity::High);
    }

    #[test]
    fn tree_has_one_leaf_per_skill() {
        let task = Task::new("brief").with_capability("search").with_capability("write");
        let tree = ExecutionTree::build(&task, &TaskAnalysis::analyze(&task));
        assert_eq!(tree.leaf_count(), 2);
        assert!(tree.root.parallel);
        let caps: Vec<_> = tree
            .root
            .leaves()
            .iter()
            .map(|s| s.capability.clone().unwrap())
            .collect();
        assert_eq!(caps, vec!["search", "write"]);
    }

    #[test]
    fn skill_less_task_gets_general_leaf() {
        let task = Task::new("say hi");
        let tree = ExecutionTree::build(&task, &TaskAnalysis::analyze(&task));
        assert_eq!(tree.leaf_count(), 1);
        assert_eq!(tree.root.leaves()[0].capability, None);
    }
}
