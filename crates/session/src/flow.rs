use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolStatus {
    Running,
    Succeeded { result: Option<String> },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowOutcome {
    Success,
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlowStage {
    ToolPlanning {
        summary: String,
        tool_count: usize,
    },
    ToolCall {
        id: String,
        name: String,
        args: Value,
        progress: Option<String>,
        status: ToolStatus,
    },
    Responding,
    Fallback {
        summary: String,
        error_count: u32,
    },
    Completed(FlowOutcome),
}

/// Ordered record of what the server did to produce one response.
///
/// Every mutator returns `false` once the flow has completed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThinkingFlow {
    stages: Vec<FlowStage>,
}

impl ThinkingFlow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stages(&self) -> &[FlowStage] {
        &self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn outcome(&self) -> Option<&FlowOutcome> {
        match self.stages.last() {
            Some(FlowStage::Completed(outcome)) => Some(outcome),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.outcome().is_some()
    }

    pub fn plan(&mut self, summary: impl Into<String>, tool_count: usize) -> bool {
        self.push(FlowStage::ToolPlanning {
            summary: summary.into(),
            tool_count,
        })
    }

    pub fn start_tool(
        &mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        args: Value,
        progress: Option<String>,
    ) -> bool {
        self.push(FlowStage::ToolCall {
            id: id.into(),
            name: name.into(),
            args,
            progress,
            status: ToolStatus::Running,
        })
    }

    /// Settles the most recent call with `id`; a result for an unseen id records the call.
    pub fn finish_tool(&mut self, id: &str, name: Option<&str>, status: ToolStatus) -> bool {
        if self.is_closed() {
            return false;
        }
        if let Some(existing) = self.tool_call_mut(id) {
            *existing = status;
            return true;
        }
        self.push(FlowStage::ToolCall {
            id: id.to_string(),
            name: name.unwrap_or_default().to_string(),
            args: Value::Null,
            progress: None,
            status,
        })
    }

    pub fn respond(&mut self) -> bool {
        if matches!(self.stages.last(), Some(FlowStage::Responding)) {
            return true;
        }
        self.push(FlowStage::Responding)
    }

    pub fn fallback(&mut self, summary: impl Into<String>, error_count: u32) -> bool {
        self.push(FlowStage::Fallback {
            summary: summary.into(),
            error_count,
        })
    }

    /// Closes the flow; only the first call has any effect.
    pub fn complete(&mut self, outcome: FlowOutcome) -> bool {
        if self.is_closed() {
            return false;
        }
        for stage in &mut self.stages {
            if let FlowStage::ToolCall { status, .. } = stage
                && *status == ToolStatus::Running
                && let FlowOutcome::Error { message } = &outcome
            {
                *status = ToolStatus::Failed {
                    error: message.clone(),
                };
            }
        }
        self.stages.push(FlowStage::Completed(outcome));
        true
    }

    fn tool_call_mut(&mut self, id: &str) -> Option<&mut ToolStatus> {
        self.stages.iter_mut().rev().find_map(|stage| match stage {
            FlowStage::ToolCall {
                id: call_id,
                status,
                ..
            } if call_id == id => Some(status),
            _ => None,
        })
    }

    fn push(&mut self, stage: FlowStage) -> bool {
        if self.is_closed() {
            return false;
        }
        self.stages.push(stage);
        true
    }
}
