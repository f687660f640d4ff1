//! Engine configuration
//!
//! [`EngineConfig`] is an immutable snapshot built once from an
//! [`EngineOptions`] map. Reconfiguring an engine builds a fresh snapshot;
//! a snapshot already handed to a running activation is never mutated.
//!
//! Threshold derivation:
//!
//! ```text
//! multi_tier                  = multi_tier option && !compile_immediately
//! background_compilation      = background option && !compile_aot_on_create
//! call  threshold (interp)    = 0 | min(first_tier_min_invoke, first_tier)   (multi-tier)
//!                                 | min(min_invoke, single_tier)             (single tier)
//! call+loop threshold (interp)= 0 | first_tier | single_tier
//! call  threshold (tier 1)    = 0 | min(min_invoke, last_tier)
//! call+loop threshold (tier 1)= 0 | last_tier
//! ```
//!
//! where `0` applies whenever `compile_immediately` is set.

use std::sync::OnceLock;

use tracing::warn;

use super::filter::CompileOnlyFilter;
use super::options::{keys, ConfigError, ConfigResult, EngineOptions};

pub const DEFAULT_MIN_INVOKE_THRESHOLD: u32 = 3;
pub const DEFAULT_FIRST_TIER_MIN_INVOKE_THRESHOLD: u32 = 1;
pub const DEFAULT_FIRST_TIER_COMPILATION_THRESHOLD: u32 = 400;
pub const DEFAULT_SINGLE_TIER_COMPILATION_THRESHOLD: u32 = 1000;
pub const DEFAULT_LAST_TIER_COMPILATION_THRESHOLD: u32 = 10000;
pub const DEFAULT_OSR_COMPILATION_THRESHOLD: u32 = 100_352;
pub const DEFAULT_OSR_MAX_COMPILATION_REATTEMPTS: u32 = 30;
pub const DEFAULT_FIRST_TIER_BONUS: f64 = 15.0;

/// What to do when a compilation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompilationFailureAction {
    /// Only emit the failure event
    #[default]
    Silent,
    /// Log a warning
    Print,
    /// Surface the failure to the entering call when compiling synchronously
    Throw,
}

impl CompilationFailureAction {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "silent" => Some(Self::Silent),
            "print" => Some(Self::Print),
            "throw" => Some(Self::Throw),
            _ => None,
        }
    }
}

/// Immutable engine configuration snapshot
#[derive(Debug)]
pub struct EngineConfig {
    // Raw options
    pub compilation: bool,
    pub compile_immediately: bool,
    pub compile_aot_on_create: bool,
    pub min_invoke_threshold: u32,
    pub first_tier_min_invoke_threshold: u32,
    pub first_tier_compilation_threshold: u32,
    pub single_tier_compilation_threshold: u32,
    pub last_tier_compilation_threshold: u32,
    pub osr: bool,
    pub osr_compilation_threshold: u32,
    pub osr_max_compilation_reattempts: u32,
    pub traversing_compilation_queue: bool,
    pub traversing_queue_weighting_both_tiers: bool,
    pub traversing_queue_first_tier_priority: bool,
    pub splitting: bool,
    pub splitting_allow_forced_splits: bool,
    pub splitting_max_callee_size: u32,
    pub splitting_growth_limit: f64,
    pub splitting_max_propagation_depth: u32,
    pub compiler_threads: usize,
    pub compilation_failure_action: CompilationFailureAction,
    pub trace_compilation: bool,

    // Derived
    pub multi_tier: bool,
    pub background_compilation: bool,
    pub call_threshold_in_interpreter: u32,
    pub call_and_loop_threshold_in_interpreter: u32,
    pub call_threshold_in_first_tier: u32,
    pub call_and_loop_threshold_in_first_tier: u32,
    pub first_tier_bonus: f64,

    compile_only: Option<String>,
    compile_only_filter: OnceLock<CompileOnlyFilter>,
}

impl EngineConfig {
    /// Build a snapshot from named options.
    ///
    /// Self-contradictory but usable combinations are logged and accepted;
    /// unknown keys and ill-typed or negative values are errors.
    pub fn load(options: &EngineOptions) -> ConfigResult<Self> {
        options.check_keys()?;

        let compile_immediately = options.bool_or(keys::COMPILE_IMMEDIATELY, false)?;
        let compile_aot_on_create = options.bool_or(keys::COMPILE_AOT_ON_CREATE, false)?;
        let multi_tier_option = options.bool_or(keys::MULTI_TIER, true)?;
        let background_option = options.bool_or(keys::BACKGROUND_COMPILATION, true)?;

        let min_invoke = options.threshold_or(keys::MIN_INVOKE_THRESHOLD, DEFAULT_MIN_INVOKE_THRESHOLD)?;
        let first_tier_min_invoke = options.threshold_or(
            keys::FIRST_TIER_MIN_INVOKE_THRESHOLD,
            DEFAULT_FIRST_TIER_MIN_INVOKE_THRESHOLD,
        )?;
        let first_tier = options.threshold_or(
            keys::FIRST_TIER_COMPILATION_THRESHOLD,
            DEFAULT_FIRST_TIER_COMPILATION_THRESHOLD,
        )?;
        let single_tier = options.threshold_or(
            keys::SINGLE_TIER_COMPILATION_THRESHOLD,
            DEFAULT_SINGLE_TIER_COMPILATION_THRESHOLD,
        )?;
        let last_tier = options.threshold_or(
            keys::LAST_TIER_COMPILATION_THRESHOLD,
            DEFAULT_LAST_TIER_COMPILATION_THRESHOLD,
        )?;

        let multi_tier = multi_tier_option && !compile_immediately;
        let background_compilation = background_option && !compile_aot_on_create;

        let (call_interp, call_loop_interp, call_first, call_loop_first) = if compile_immediately {
            (0, 0, 0, 0)
        } else if multi_tier {
            (
                first_tier_min_invoke.min(first_tier),
                first_tier,
                min_invoke.min(last_tier),
                last_tier,
            )
        } else {
            (
                min_invoke.min(single_tier),
                single_tier,
                min_invoke.min(last_tier),
                last_tier,
            )
        };

        let bonus_option = options.float_or(
            keys::TRAVERSING_QUEUE_FIRST_TIER_BONUS,
            DEFAULT_FIRST_TIER_BONUS,
        )?;
        let first_tier_bonus = if first_tier == 0 {
            warn!(
                "{} is 0, cannot scale the first-tier queue bonus; using the raw bonus {}",
                keys::FIRST_TIER_COMPILATION_THRESHOLD,
                bonus_option
            );
            bonus_option
        } else {
            bonus_option * f64::from(last_tier) / f64::from(first_tier)
        };

        let failure_action = match options.str_opt(keys::COMPILATION_FAILURE_ACTION)? {
            None => CompilationFailureAction::default(),
            Some(value) => CompilationFailureAction::parse(&value).ok_or_else(|| {
                ConfigError::InvalidChoice {
                    key: keys::COMPILATION_FAILURE_ACTION.to_string(),
                    value,
                }
            })?,
        };
        if failure_action == CompilationFailureAction::Throw && background_compilation {
            warn!(
                "compilation_failure_action=throw has no effect with background compilation enabled; \
                 failures will be printed instead"
            );
        }

        let compiler_threads = match options.threshold_or(keys::COMPILER_THREADS, 0)? {
            0 => (num_cpus::get() / 2).max(1),
            n => n as usize,
        };

        Ok(EngineConfig {
            compilation: options.bool_or(keys::COMPILATION, true)?,
            compile_immediately,
            compile_aot_on_create,
            min_invoke_threshold: min_invoke,
            first_tier_min_invoke_threshold: first_tier_min_invoke,
            first_tier_compilation_threshold: first_tier,
            single_tier_compilation_threshold: single_tier,
            last_tier_compilation_threshold: last_tier,
            osr: options.bool_or(keys::OSR, true)?,
            osr_compilation_threshold: options.threshold_or(
                keys::OSR_COMPILATION_THRESHOLD,
                DEFAULT_OSR_COMPILATION_THRESHOLD,
            )?,
            osr_max_compilation_reattempts: options.threshold_or(
                keys::OSR_MAX_COMPILATION_REATTEMPTS,
                DEFAULT_OSR_MAX_COMPILATION_REATTEMPTS,
            )?,
            traversing_compilation_queue: options.bool_or(keys::TRAVERSING_COMPILATION_QUEUE, true)?,
            traversing_queue_weighting_both_tiers: options
                .bool_or(keys::TRAVERSING_QUEUE_WEIGHTING_BOTH_TIERS, true)?,
            traversing_queue_first_tier_priority: options
                .bool_or(keys::TRAVERSING_QUEUE_FIRST_TIER_PRIORITY, false)?,
            splitting: options.bool_or(keys::SPLITTING, true)?,
            splitting_allow_forced_splits: options.bool_or(keys::SPLITTING_ALLOW_FORCED_SPLITS, true)?,
            splitting_max_callee_size: options.threshold_or(keys::SPLITTING_MAX_CALLEE_SIZE, 100)?,
            splitting_growth_limit: options.float_or(keys::SPLITTING_GROWTH_LIMIT, 1.5)?,
            splitting_max_propagation_depth: options
                .threshold_or(keys::SPLITTING_MAX_PROPAGATION_DEPTH, 5)?,
            compiler_threads,
            compilation_failure_action: failure_action,
            trace_compilation: options.bool_or(keys::TRACE_COMPILATION, false)?,
            multi_tier,
            background_compilation,
            call_threshold_in_interpreter: call_interp,
            call_and_loop_threshold_in_interpreter: call_loop_interp,
            call_threshold_in_first_tier: call_first,
            call_and_loop_threshold_in_first_tier: call_loop_first,
            first_tier_bonus,
            compile_only: options.str_opt(keys::COMPILE_ONLY)?,
            compile_only_filter: OnceLock::new(),
        })
    }

    /// Snapshot with every option at its default
    pub fn defaults() -> Self {
        // The empty snapshot has no keys or values that can fail validation.
        match Self::load(&EngineOptions::new()) {
            Ok(config) => config,
            Err(err) => unreachable!("default options rejected: {err}"),
        }
    }

    /// Raw compile-only option value, if any
    pub fn compile_only(&self) -> Option<&str> {
        self.compile_only.as_deref()
    }

    /// Compile-only filter, parsed on first use
    pub fn compile_only_filter(&self) -> &CompileOnlyFilter {
        self.compile_only_filter
            .get_or_init(|| match &self.compile_only {
                Some(list) => CompileOnlyFilter::parse(list),
                None => CompileOnlyFilter::accept_all(),
            })
    }

    /// Whether a unit with this name may be compiled at all
    pub fn accepts_for_compilation(&self, name: &str) -> bool {
        self.compilation && self.compile_only_filter().accepts(name)
    }

    /// Failure action actually in effect
    pub fn effective_failure_action(&self) -> CompilationFailureAction {
        match self.compilation_failure_action {
            CompilationFailureAction::Throw if self.background_compilation => {
                CompilationFailureAction::Print
            }
            action => action,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

// =============================================================================
// Tests
// =============================================================================
