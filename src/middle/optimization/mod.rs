//! Optimization passes over LIR and the fixed order the driver runs them in.

use std::collections::BTreeSet;

use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

use crate::{
    diagnostics::Diagnostics,
    error::InternalError,
    middle::{
        analysis::cfg,
        lir::{Function, Module},
    },
};

pub mod cfg_simplify;
pub mod sccp;
pub mod ssa;

use cfg_simplify::{SimplifyStatistics, simplify_cfg};
use sccp::{SccpStatistics, propagate_constants};
use ssa::{construct_ssa, destruct::DestructionStatistics, destruct_ssa};

/// A stage of the pipeline, named the way it is selected on the command line
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumString, Display, EnumIter,
)]
pub enum Pass {
    #[strum(serialize = "mem2reg")]
    Mem2Reg,
    #[strum(serialize = "sccp")]
    Sccp,
    #[strum(serialize = "simplify-cfg")]
    SimplifyCfg,
    #[strum(serialize = "destruct")]
    Destruct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    pub passes: BTreeSet<Pass>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            passes: Pass::iter().collect(),
        }
    }
}

impl PipelineOptions {
    pub fn only(passes: impl IntoIterator<Item = Pass>) -> Self {
        Self {
            passes: passes.into_iter().collect(),
        }
    }

    pub fn runs(&self, pass: Pass) -> bool {
        self.passes.contains(&pass)
    }
}

/// What each pass that ran did to one function
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizationSummary {
    pub promoted: Option<usize>,
    pub sccp: Option<SccpStatistics>,
    pub simplify: Option<SimplifyStatistics>,
    pub destruction: Option<DestructionStatistics>,
}

/// Runs the enabled passes in pipeline order regardless of the order they
/// were requested in
pub fn optimize_function(
    function: &mut Function,
    options: &PipelineOptions,
    diagnostics: &mut Diagnostics,
) -> Result<OptimizationSummary, InternalError> {
    let _span = tracing::debug_span!("optimize", function = %function.symbol_name).entered();

    let mut summary = OptimizationSummary::default();
    cfg::build(function)?;

    if options.runs(Pass::Mem2Reg) {
        summary.promoted = Some(construct_ssa(function, diagnostics)?);
    }

    if options.runs(Pass::Sccp) {
        summary.sccp = Some(propagate_constants(function, diagnostics)?);
    }

    if options.runs(Pass::SimplifyCfg) {
        summary.simplify = Some(simplify_cfg(function)?);
    }

    if options.runs(Pass::Destruct) {
        summary.destruction = Some(destruct_ssa(function)?);
    }

    Ok(summary)
}

pub fn optimize_module(
    module: &mut Module,
    options: &PipelineOptions,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<OptimizationSummary>, InternalError> {
    module
        .functions
        .iter_mut()
        .map(|function| optimize_function(function, options, diagnostics))
        .collect()
}
