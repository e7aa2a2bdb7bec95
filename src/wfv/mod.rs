//! Whole-function vectorization pipeline.
//!
//! The stages run in a fixed order, each relying on what the previous ones
//! established (see [`VectorizerInterface::linearize`]):
//! 1. [`div_loop`]: loops with a varying exit condition get a uniform one
//!    (`rv_any` of the lanes still active), with live-out values tracked
//!    per lane
//! 2. [`mask`]: every block (and CFG edge) of the region gets a predicate of
//!    the lanes active in it
//! 3. [`linearize`]: divergent branches are replaced by fall-through in a
//!    topological order, with phis turned into selects on edge predicates,
//!    and side effects guarded by block predicates
//! 4. [`red_opt`]: reduction chains are split into per-iteration partial
//!    updates and a single fold of the accumulator
//!
//! [`rem_transform`] is separate, and meant to be used while picking loops to
//! vectorize (i.e. before any of the above), to split off loop iterations
//! that don't fill a whole vector.

// NOTE all the modules are declared here, but they're documented "inside"
// (i.e. using inner doc comments).
pub mod config;
pub mod div_loop;
pub mod info;
pub mod intrinsics;
pub mod linearize;
pub mod loop_shape;
pub mod mask;
pub mod native;
pub mod red_opt;
pub mod reduction;
pub mod rem_transform;
pub mod shape;


pub use config::VectorizerConfig;
pub use info::{Region, VectorizationInfo};
pub use intrinsics::{IntrinsicKind, IntrinsicRegistry};
pub use loop_shape::LoopRejection;
pub use shape::VectorShape;

use crate::builder::{FuncBuilder, InsertPoint};
use crate::cf::CfgAnalyses;
use crate::{Block, Context, FuncDefBody, FxIndexMap, Module};
use serde::Serialize;
use std::rc::Rc;

/// Failure of (a stage of) the vectorizer.
///
/// [`VectorizeError::UnsupportedLoop`] and [`VectorizeError::UnsupportedBranch`]
/// are capability failures (the caller can fall back to scalar code), while
/// the rest indicate broken invariants (i.e. the inputs, usually shapes from
/// an external analysis, didn't satisfy the pipeline's preconditions).
#[derive(Clone, Debug, thiserror::Error)]
pub enum VectorizeError {
    #[error("unsupported loop (header {header}): {reason}")]
    UnsupportedLoop { header: Block, reason: LoopRejection },

    #[error("unsupported divergent branch in {block}: {reason}")]
    UnsupportedBranch { block: Block, reason: String },

    #[error("control-flow cycle through {block} is not a recognized loop")]
    IrreducibleCycle { block: Block },

    #[error("BUG at {location}: {message}")]
    Bug { location: &'static std::panic::Location<'static>, message: String },
}

impl VectorizeError {
    #[track_caller]
    pub fn bug(message: impl Into<String>) -> Self {
        Self::Bug { location: std::panic::Location::caller(), message: message.into() }
    }

    /// Whether this is a capability failure, as opposed to a broken invariant.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::UnsupportedLoop { .. } | Self::UnsupportedBranch { .. })
    }
}

/// Everything a stage works on: the function being vectorized, its shared
/// vectorization state, and the (read-only) intrinsic mapping.
pub struct StageCx<'a> {
    pub cx: &'a Context,
    pub func: &'a mut FuncDefBody,
    pub vinfo: &'a mut VectorizationInfo,
    pub intrinsics: &'a IntrinsicRegistry,
}

impl StageCx<'_> {
    pub fn builder(&mut self, at: InsertPoint) -> FuncBuilder<'_> {
        FuncBuilder::new(self.cx, self.func, at)
    }

    pub fn reborrow(&mut self) -> StageCx<'_> {
        StageCx { cx: self.cx, func: self.func, vinfo: self.vinfo, intrinsics: self.intrinsics }
    }
}

/// A stage provided from outside this crate (e.g. struct-layout optimization),
/// plugged into [`VectorizerInterface::vectorize`].
pub trait ExternalStage {
    fn run(&mut self, st: &mut StageCx<'_>) -> Result<(), VectorizeError>;
}

/// Where an [`ExternalStage`] runs, in [`VectorizerInterface::vectorize`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum StageSlot {
    StructOpt,
    Srov,
    IrPolish,
}

impl StageSlot {
    fn name(self) -> &'static str {
        match self {
            StageSlot::StructOpt => "struct opt",
            StageSlot::Srov => "SROV opt",
            StageSlot::IrPolish => "IR polisher",
        }
    }
}

/// Counters reported by the pipeline stages.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug, Serialize)]
pub struct PipelineStats {
    pub normalized_loops: usize,
    pub linearized_regions: usize,
    pub linearized_blocks: usize,
    pub scalarized_calls: usize,
    pub optimized_reductions: usize,
}

/// Entry-point of the vectorizer, holding what's shared across functions.
pub struct VectorizerInterface {
    cx: Rc<Context>,
    config: VectorizerConfig,
    intrinsics: IntrinsicRegistry,
    external_stages: FxIndexMap<StageSlot, Box<dyn ExternalStage>>,
}

impl VectorizerInterface {
    pub fn new(module: &mut Module, config: VectorizerConfig) -> Self {
        Self {
            cx: module.cx(),
            config,
            intrinsics: IntrinsicRegistry::new(module),
            external_stages: FxIndexMap::default(),
        }
    }

    pub fn config(&self) -> &VectorizerConfig {
        &self.config
    }

    pub fn intrinsics(&self) -> &IntrinsicRegistry {
        &self.intrinsics
    }

    pub fn set_external_stage(&mut self, slot: StageSlot, stage: Box<dyn ExternalStage>) {
        self.external_stages.insert(slot, stage);
    }

    /// Turn all the divergent control-flow of the region into uniform control
    /// flow, with predicated blocks (normalize divergent loops, expand masks,
    /// linearize).
    pub fn linearize(
        &self,
        func: &mut FuncDefBody,
        vinfo: &mut VectorizationInfo,
    ) -> Result<PipelineStats, VectorizeError> {
        let mut stats = PipelineStats::default();
        let mut st = StageCx { cx: &self.cx, func, vinfo, intrinsics: &self.intrinsics };

        let analyses = CfgAnalyses::compute(st.func);
        let mut mask_ex = mask::MaskExpander::new();

        stats.normalized_loops = div_loop::DivLoopTrans::new()
            .transform_divergent_loops(&mut st, &mut mask_ex, &analyses)?;

        // Loop normalization changes branch conditions, so all analyses are
        // recomputed before anything else looks at the CFG.
        let analyses = CfgAnalyses::compute(st.func);
        mask_ex.expand_region_masks(&mut st, &analyses.cfg);

        let linearizer_stats = linearize::Linearizer::new(&self.config).run(&mut st, &mut mask_ex)?;
        stats.linearized_regions = linearizer_stats.regions;
        stats.linearized_blocks = linearizer_stats.blocks;
        stats.scalarized_calls = linearizer_stats.scalarized_calls;
        Ok(stats)
    }

    /// Run the remaining stages on an already-linearized function: external
    /// stages (if registered and enabled), and reduction optimization.
    pub fn vectorize(
        &mut self,
        func: &mut FuncDefBody,
        vinfo: &mut VectorizationInfo,
    ) -> Result<PipelineStats, VectorizeError> {
        let mut stats = PipelineStats::default();

        self.run_external_stage(StageSlot::StructOpt, self.config.struct_opt, func, vinfo)?;
        self.run_external_stage(StageSlot::Srov, self.config.srov, func, vinfo)?;

        if self.config.reduction_opt {
            let analyses = CfgAnalyses::compute(func);
            let reda = reduction::ReductionAnalysis::analyze(&self.cx, func, &analyses.loops);
            let mut st = StageCx { cx: &self.cx, func, vinfo, intrinsics: &self.intrinsics };
            stats.optimized_reductions = red_opt::ReductionOptimization::new(&reda).run(&mut st)?;
        } else {
            log::info!(target: "wfv", "Reduction opt disabled");
        }

        self.run_external_stage(StageSlot::IrPolish, self.config.ir_polish, func, vinfo)?;
        Ok(stats)
    }

    fn run_external_stage(
        &mut self,
        slot: StageSlot,
        enabled: bool,
        func: &mut FuncDefBody,
        vinfo: &mut VectorizationInfo,
    ) -> Result<(), VectorizeError> {
        if !enabled {
            log::info!(target: "wfv", "{} disabled", slot.name());
            return Ok(());
        }
        let Some(stage) = self.external_stages.get_mut(&slot) else {
            log::debug!(target: "wfv", "no {} registered", slot.name());
            return Ok(());
        };
        stage.run(&mut StageCx { cx: &self.cx, func, vinfo, intrinsics: &self.intrinsics })
    }

    /// Run the whole pipeline ([`linearize`](Self::linearize), then
    /// [`vectorize`](Self::vectorize)) on `func`.
    ///
    /// On error, `func` and `vinfo` are restored to their original state, so
    /// the caller can fall back to scalar code.
    pub fn run_pipeline(
        &mut self,
        func: &mut FuncDefBody,
        vinfo: &mut VectorizationInfo,
    ) -> Result<PipelineStats, VectorizeError> {
        let (original_func, original_vinfo) = (func.clone(), vinfo.clone());

        let result = self.try_run_pipeline(func, vinfo);
        match &result {
            Ok(stats) => {
                log::info!(target: "wfv", "pipeline done: {}", serde_json::json!(stats));
            }
            Err(err) => {
                log::warn!(target: "wfv", "pipeline failed, rolling back: {err}");
                *func = original_func;
                *vinfo = original_vinfo;
            }
        }
        result
    }

    fn try_run_pipeline(
        &mut self,
        func: &mut FuncDefBody,
        vinfo: &mut VectorizationInfo,
    ) -> Result<PipelineStats, VectorizeError> {
        let mut stats = PipelineStats::default();
        if self.config.control_flow {
            stats = self.linearize(func, vinfo)?;
        } else {
            log::info!(target: "wfv", "control-flow linearization disabled");
        }
        stats.optimized_reductions = self.vectorize(func, vinfo)?.optimized_reductions;
        Ok(stats)
    }
}
