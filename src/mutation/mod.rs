//! Mutation engine: wraps an external corruptor and composes its output
//! with the original payload under strict size bounds.
//!
//! Every composed operation except [`MutationEngine::pass`] returns a
//! buffer whose length lies in `[MIN_OUTPUT_SIZE, MAX_BUFFER_SIZE]`.
//! Mutator failures never propagate: the affected call falls back to
//! cyclic repetition of the caller's input.

mod process;

pub use process::ExternalMutator;

use crate::error::{MutatorError, ProxyError};
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const BATCH: usize = 4096;
pub const MIN_OUTPUT_SIZE: usize = 100 * BATCH;
pub const MAX_BUFFER_SIZE: usize = 10_000 * BATCH;
pub const MAX_MUTATOR_ARGS: usize = 20;
/// Largest payload the UDP relay puts on the wire.
pub const UDP_PAYLOAD_CEILING: usize = 65_500;

pub const DEFAULT_MUTATOR_PATH: &str = "./radamsa";
pub const DEFAULT_MUTATOR_TIMEOUT: Duration = Duration::from_secs(10);

/// Mutation strategy; selects extra mutator flags at construction time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FuzzStyle {
    #[default]
    Randomization,
    Truncate,
    Insert,
    Overflow,
    Custom,
}

impl FuzzStyle {
    fn mutation_flags(self) -> Option<&'static str> {
        match self {
            FuzzStyle::Randomization => None,
            FuzzStyle::Truncate => Some("td,tr2,ts1"),
            FuzzStyle::Insert => Some("li,lp,ls,lis"),
            FuzzStyle::Overflow => Some("bd,bf,br,bp"),
            FuzzStyle::Custom => Some("ab,xp=9,bei,ber,uw"),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            FuzzStyle::Randomization => "randomization",
            FuzzStyle::Truncate => "truncate",
            FuzzStyle::Insert => "insert",
            FuzzStyle::Overflow => "overflow",
            FuzzStyle::Custom => "custom",
        }
    }
}

impl fmt::Display for FuzzStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FuzzStyle {
    type Err = ProxyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "randomization" | "random" => Ok(FuzzStyle::Randomization),
            "truncate" => Ok(FuzzStyle::Truncate),
            "insert" => Ok(FuzzStyle::Insert),
            "overflow" => Ok(FuzzStyle::Overflow),
            "custom" => Ok(FuzzStyle::Custom),
            other => Err(ProxyError::config(format!("unknown fuzz style '{other}'"))),
        }
    }
}

/// Mutator command line for `style`. The program name counts against
/// `MAX_MUTATOR_ARGS` and one slot stays reserved, so at most
/// `MAX_MUTATOR_ARGS - 2` arguments are returned.
pub fn style_arguments(style: FuzzStyle) -> Vec<String> {
    let mut args = MutatorArgs::default();
    args.push("-n");
    args.push("1");
    args.push("-g");
    args.push("stdin=1048576");
    args.push("-p");
    args.push("od,nd=2,bu");
    if let Some(flags) = style.mutation_flags() {
        args.push("-m");
        args.push(flags);
    }
    args.into_inner()
}

#[derive(Default)]
pub(crate) struct MutatorArgs {
    args: Vec<String>,
}

impl MutatorArgs {
    pub(crate) fn push(&mut self, arg: impl Into<String>) {
        // +1 for the program name, +1 for the reserved terminator slot.
        if self.args.len() + 2 < MAX_MUTATOR_ARGS {
            self.args.push(arg.into());
        }
    }

    pub(crate) fn into_inner(self) -> Vec<String> {
        self.args
    }
}

/// Anything that can turn a payload into a corrupted variant.
pub trait Corruptor: Send + Sync {
    fn corrupt(&self, input: &[u8]) -> Result<Vec<u8>, MutatorError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutatorConfig {
    pub path: PathBuf,
    pub style: FuzzStyle,
    pub timeout: Duration,
}

impl Default for MutatorConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_MUTATOR_PATH),
            style: FuzzStyle::default(),
            timeout: DEFAULT_MUTATOR_TIMEOUT,
        }
    }
}

#[derive(Default)]
struct MutationStats {
    invocations: AtomicU64,
    failures: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MutationCounters {
    pub invocations: u64,
    pub failures: u64,
}

pub struct MutationEngine {
    style: FuzzStyle,
    corruptor: Arc<dyn Corruptor>,
    stats: MutationStats,
}

impl MutationEngine {
    pub fn new(config: &MutatorConfig) -> Self {
        let mutator = ExternalMutator::new(config.path.clone(), config.style, config.timeout);
        logger::breadcrumb(
            BreadcrumbFlags::MUTATOR,
            format!(
                "mutator {} style={} args={:?} timeout={:?}",
                config.path.display(),
                config.style,
                mutator.args(),
                config.timeout
            ),
        );
        Self::with_corruptor(config.style, Arc::new(mutator))
    }

    pub fn with_corruptor(style: FuzzStyle, corruptor: Arc<dyn Corruptor>) -> Self {
        Self {
            style,
            corruptor,
            stats: MutationStats::default(),
        }
    }

    pub fn style(&self) -> FuzzStyle {
        self.style
    }

    pub fn counters(&self) -> MutationCounters {
        MutationCounters {
            invocations: self.stats.invocations.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
        }
    }

    /// One mutator invocation. `None` on any failure or an empty result.
    pub fn run_mutator(&self, input: &[u8]) -> Option<Vec<u8>> {
        self.stats.invocations.fetch_add(1, Ordering::Relaxed);
        match self.corruptor.corrupt(input) {
            Ok(mut output) if !output.is_empty() => {
                output.truncate(MAX_BUFFER_SIZE);
                Some(output)
            }
            Ok(_) => {
                self.record_failure(&MutatorError::Empty);
                None
            }
            Err(error) => {
                self.record_failure(&error);
                None
            }
        }
    }

    fn record_failure(&self, error: &MutatorError) {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        logger::rate_limited_error(
            ErrorCategory::Mutator,
            format!("mutator invocation failed, using fallback: {error}"),
        );
    }

    /// Mutator output, extended with cyclic copies of `input` until it is
    /// at least `budget` bytes long. Fails over to pure repetition.
    fn expand(&self, input: &[u8], budget: usize) -> Option<Vec<u8>> {
        let mut output = self.run_mutator(input).unwrap_or_default();
        if output.len() < budget {
            output.try_reserve_exact(budget - output.len()).ok()?;
            extend_cyclic(&mut output, input, budget);
        }
        Some(output)
    }

    /// Identity; exempt from normalization.
    pub fn pass(&self, input: &[u8]) -> Vec<u8> {
        input.to_vec()
    }

    /// `mutate(x) ++ x`, normalized.
    pub fn pre_fuzzing(&self, input: &[u8]) -> Vec<u8> {
        let budget = MIN_OUTPUT_SIZE.saturating_sub(input.len());
        let Some(mutated) = self.expand(input, budget) else {
            return input.to_vec();
        };
        match concat(&[&mutated, input]) {
            Some(candidate) => normalize_output_size(&candidate, input),
            None => input.to_vec(),
        }
    }

    /// `x ++ mutate(x)`, normalized.
    pub fn post_fuzzing(&self, input: &[u8]) -> Vec<u8> {
        let budget = MIN_OUTPUT_SIZE.saturating_sub(input.len());
        let Some(mutated) = self.expand(input, budget) else {
            return input.to_vec();
        };
        match concat(&[input, &mutated]) {
            Some(candidate) => normalize_output_size(&candidate, input),
            None => input.to_vec(),
        }
    }

    /// `mutate1(x) ++ x ++ mutate2(x)` from two independent invocations,
    /// normalized. A failed invocation contributes nothing.
    pub fn full_fuzzing(&self, input: &[u8]) -> Vec<u8> {
        let (Some(head), Some(tail)) = (self.expand(input, 0), self.expand(input, 0)) else {
            return input.to_vec();
        };
        match concat(&[&head, input, &tail]) {
            Some(candidate) => normalize_output_size(&candidate, input),
            None => input.to_vec(),
        }
    }

    /// Not implemented yet: only zero-pads to `MIN_OUTPUT_SIZE` or
    /// truncates to `MAX_BUFFER_SIZE`, no corruption is applied.
    pub fn guided_fuzzing(&self, input: &[u8]) -> Vec<u8> {
        logger::breadcrumb(
            BreadcrumbFlags::MUTATOR,
            "guided fuzzing is not implemented, padding only",
        );
        let target = input.len().clamp(MIN_OUTPUT_SIZE, MAX_BUFFER_SIZE);
        let mut output = Vec::new();
        if output.try_reserve_exact(target).is_err() {
            return input.to_vec();
        }
        output.extend_from_slice(&input[..input.len().min(target)]);
        output.resize(target, 0);
        output
    }
}

/// Brings `candidate` into `[MIN_OUTPUT_SIZE, MAX_BUFFER_SIZE]`. Short
/// buffers are extended by cycling `original` (not `candidate`); an empty
/// `original` leaves a zero-filled gap.
pub fn normalize_output_size(candidate: &[u8], original: &[u8]) -> Vec<u8> {
    let len = candidate.len();
    if (MIN_OUTPUT_SIZE..=MAX_BUFFER_SIZE).contains(&len) {
        return candidate.to_vec();
    }
    if len > MAX_BUFFER_SIZE {
        return candidate[..MAX_BUFFER_SIZE].to_vec();
    }

    let mut output = Vec::new();
    if output.try_reserve_exact(MIN_OUTPUT_SIZE).is_err() {
        return original.to_vec();
    }
    output.extend_from_slice(candidate);
    extend_cyclic(&mut output, original, MIN_OUTPUT_SIZE);
    output
}

/// [`normalize_output_size`] of a buffer against itself.
pub fn normalize(input: &[u8]) -> Vec<u8> {
    normalize_output_size(input, input)
}

fn extend_cyclic(output: &mut Vec<u8>, pattern: &[u8], target: usize) {
    if pattern.is_empty() {
        if output.len() < target {
            output.resize(target, 0);
        }
        return;
    }
    while output.len() < target {
        let take = pattern.len().min(target - output.len());
        output.extend_from_slice(&pattern[..take]);
    }
}

fn concat(parts: &[&[u8]]) -> Option<Vec<u8>> {
    let total = parts.iter().map(|part| part.len()).sum();
    let mut output = Vec::new();
    output.try_reserve_exact(total).ok()?;
    for part in parts {
        output.extend_from_slice(part);
    }
    Some(output)
}
