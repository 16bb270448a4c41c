use crate::ir::shape_inference::ShapeError;
use crate::ir::ModelIR;
use log::debug;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error("Optimization error: {0}")]
    Error(String),
    #[error("Shape error: {0}")]
    Shape(#[from] ShapeError),
}

pub trait OptimizationPass {
    fn name(&self) -> &'static str;
    fn apply(&self, ir: &mut ModelIR) -> Result<(), OptimizerError>;
}

pub mod constant_folding;
pub mod dce;
pub mod fusion;

#[derive(Default)]
pub struct Optimizer {
    passes: Vec<Box<dyn OptimizationPass>>,
}

impl Optimizer {
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Passes run on every export. Folding also fuses batch norms into the
    /// preceding convolutions; dead code is always pruned.
    pub fn for_export(constant_folding: bool) -> Self {
        let mut optimizer = Self::new();
        if constant_folding {
            optimizer.add_pass(Box::new(constant_folding::ConstantFolding));
            optimizer.add_pass(Box::new(fusion::OperatorFusion));
        }
        optimizer.add_pass(Box::new(dce::DeadCodeElimination));
        optimizer
    }

    pub fn add_pass(&mut self, pass: Box<dyn OptimizationPass>) {
        self.passes.push(pass);
    }

    pub fn optimize(&self, ir: &mut ModelIR) -> Result<(), OptimizerError> {
        for pass in &self.passes {
            let (nodes, weights) = (ir.nodes.len(), ir.weights.len());
            pass.apply(ir)?;
            debug!(
                "{}: {} -> {} nodes, {} -> {} initializers",
                pass.name(),
                nodes,
                ir.nodes.len(),
                weights,
                ir.weights.len()
            );
        }
        Ok(())
    }
}
