//! Compilation states
//!
//! Every activation of an execution unit runs in exactly one of five states:
//!
//! ```text
//! Interpreted     tier 0, no compiled code involved
//! Tier1Root       tier 1, the activation is the root of a first-tier compilation
//! Tier1Inlined    tier 1, the activation was inlined into a first-tier caller
//! Tier2Root       tier 2, the activation is the root of a last-tier compilation
//! Tier2Inlined    tier 2, the activation was inlined into a last-tier caller
//! ```
//!
//! States are computed per activation and never stored on a unit. The
//! `*Inlined` variants only exist on frames created by
//! [`ExecutionUnit::call_inlined`](crate::unit::ExecutionUnit::call_inlined).

use std::fmt;

/// Execution state of a single activation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompilationState {
    /// Running in the interpreter
    #[default]
    Interpreted = 0,

    /// Root of first-tier compiled code
    Tier1Root = 1,

    /// Inlined into first-tier compiled code
    Tier1Inlined = 2,

    /// Root of last-tier compiled code
    Tier2Root = 3,

    /// Inlined into last-tier compiled code
    Tier2Inlined = 4,
}

impl CompilationState {
    /// Decode a raw state tag.
    ///
    /// Tags only ever come from the engine itself, so an unknown tag is a
    /// broken invariant and aborts.
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            0 => CompilationState::Interpreted,
            1 => CompilationState::Tier1Root,
            2 => CompilationState::Tier1Inlined,
            3 => CompilationState::Tier2Root,
            4 => CompilationState::Tier2Inlined,
            other => panic!("invalid compilation state tag {other}"),
        }
    }

    /// Raw tag of this state
    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Tier number: 0 for interpreted, 1 or 2 for compiled states
    #[inline]
    pub fn tier(self) -> u8 {
        match self {
            CompilationState::Interpreted => 0,
            CompilationState::Tier1Root | CompilationState::Tier1Inlined => 1,
            CompilationState::Tier2Root | CompilationState::Tier2Inlined => 2,
        }
    }

    /// Whether this activation is the root of a compilation
    #[inline]
    pub fn is_compilation_root(self) -> bool {
        matches!(
            self,
            CompilationState::Tier1Root | CompilationState::Tier2Root
        )
    }

    /// Whether this activation runs compiled code at all
    #[inline]
    pub fn is_compiled(self) -> bool {
        self != CompilationState::Interpreted
    }

    /// The inlined counterpart of this state.
    ///
    /// Used for callees executed inside a compiled caller. An interpreted
    /// caller never inlines, so `Interpreted` maps to itself.
    #[inline]
    pub fn inlined(self) -> Self {
        match self {
            CompilationState::Interpreted => CompilationState::Interpreted,
            CompilationState::Tier1Root | CompilationState::Tier1Inlined => {
                CompilationState::Tier1Inlined
            }
            CompilationState::Tier2Root | CompilationState::Tier2Inlined => {
                CompilationState::Tier2Inlined
            }
        }
    }
}

impl fmt::Display for CompilationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompilationState::Interpreted => "interpreted",
            CompilationState::Tier1Root => "tier1-root",
            CompilationState::Tier1Inlined => "tier1-inlined",
            CompilationState::Tier2Root => "tier2-root",
            CompilationState::Tier2Inlined => "tier2-inlined",
        };
        f.write_str(name)
    }
}

/// Target tier of a compile request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum CompileTier {
    /// Fast compile, lower optimisation
    First = 1,

    /// Slow compile, full optimisation
    Last = 2,
}

impl CompileTier {
    /// Tier number (1 or 2)
    #[inline]
    pub fn number(self) -> u8 {
        self as u8
    }

    /// State of a root activation running code of this tier
    #[inline]
    pub fn root_state(self) -> CompilationState {
        match self {
            CompileTier::First => CompilationState::Tier1Root,
            CompileTier::Last => CompilationState::Tier2Root,
        }
    }
}

impl fmt::Display for CompileTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier {}", self.number())
    }
}

// =============================================================================
// Tests
// =============================================================================
