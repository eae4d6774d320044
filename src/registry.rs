//! Catalog of actions, outputs and inputs available to the runtime

use crate::actions::{Action, ActionRegistry};
use crate::error::RuntimeError;
use crate::inputs::{Input, InputRegistry};
use crate::outputs::{Output, OutputRegistry};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Default)]
pub struct Catalog {
    pub actions: ActionRegistry,
    pub outputs: OutputRegistry,
    pub inputs: InputRegistry,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_action(mut self, action: Arc<dyn Action>) -> Result<Self> {
        self.actions.register(action)?;
        Ok(self)
    }

    pub fn with_output(mut self, output: Arc<dyn Output>) -> Result<Self> {
        self.outputs.register(output)?;
        Ok(self)
    }

    pub fn with_input(mut self, input: Arc<dyn Input>) -> Result<Self> {
        self.inputs.register(input)?;
        Ok(self)
    }

    /// Startup checks: well-formed names and one owner per memory key
    pub fn validate(&self) -> Result<()> {
        let names = self
            .actions
            .list()
            .into_iter()
            .chain(self.outputs.list())
            .chain(self.inputs.list());
        for name in names {
            if name.trim().is_empty() || name.chars().any(char::is_whitespace) {
                return Err(RuntimeError::InvalidRegistry(format!(
                    "invalid handler name: {:?}",
                    name
                )));
            }
        }

        let mut memory_owners: HashMap<String, &str> = HashMap::new();
        for action in self.actions.iter() {
            let Some(memory) = action.memory() else {
                continue;
            };
            if let Some(owner) = memory_owners.insert(memory.key.clone(), action.name()) {
                return Err(RuntimeError::InvalidRegistry(format!(
                    "memory key {} is shared by {} and {}",
                    memory.key,
                    owner,
                    action.name()
                )));
            }
        }

        info!(
            actions = self.actions.len(),
            outputs = self.outputs.list().len(),
            inputs = self.inputs.list().len(),
            "Catalog validated"
        );
        Ok(())
    }
}
