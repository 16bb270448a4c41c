use crate::ir::ModelIR;
use crate::optimizer::{OptimizationPass, OptimizerError};
use std::collections::HashSet;

/// Drops nodes whose outputs reach nothing, then initializers and value
/// infos that no remaining node refers to.
pub struct DeadCodeElimination;

impl OptimizationPass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dead_code_elimination"
    }

    fn apply(&self, ir: &mut ModelIR) -> Result<(), OptimizerError> {
        let mut changed = true;
        while changed {
            changed = false;
            let mut used_values = HashSet::new();

            for output in &ir.outputs {
                used_values.insert(output.name.clone());
            }

            for node in &ir.nodes {
                for input in &node.inputs {
                    used_values.insert(input.clone());
                }
            }

            let initial_len = ir.nodes.len();
            ir.nodes
                .retain(|node| node.outputs.iter().any(|output| used_values.contains(output)));

            if ir.nodes.len() != initial_len {
                changed = true;
            }
        }

        let referenced: HashSet<&str> = ir
            .nodes
            .iter()
            .flat_map(|n| n.inputs.iter().chain(n.outputs.iter()))
            .chain(ir.outputs.iter().map(|o| &o.name))
            .map(String::as_str)
            .collect();
        ir.weights.retain(|name, _| referenced.contains(name.as_str()));
        ir.value_info
            .retain(|info| referenced.contains(info.name.as_str()));
        Ok(())
    }
}
