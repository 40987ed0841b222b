//! Run configuration: defaults, command-line surface and environment overrides.

use crate::algs::reduction::ReducerStrategy;
use crate::data::partition::SorParams;
use crate::halo::{Delivery, ExchangeMode};
use crate::sor_error::SorError;
use serde::{Deserialize, Serialize};

/// Environment switch selecting the linear (O(P)) reducer over the tree.
pub const ENV_BCAST_LINEAR: &str = "SOR_BCAST_LINEAR";
/// Environment switch enabling per-phase timing reports.
pub const ENV_TIMING: &str = "SOR_TIMING";

/// Interior edge length used when no `<N>` is given.
pub const DEFAULT_INTERIOR: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SorConfig {
    /// Grid edge length including the two fixed boundary rows.
    pub n: usize,
    /// Iterations to run; 0 selects dynamic termination.
    pub max_iters: usize,
    /// Reduce even in fixed-count mode.
    pub reduce_always: bool,
    pub exchange: ExchangeMode,
    pub delivery: Delivery,
    /// Reduce every `iters_per_reduce` iterations (at least 1).
    pub iters_per_reduce: usize,
    pub reducer: ReducerStrategy,
    /// Run one untimed pass before the measured one.
    pub warmup: bool,
    pub timings: bool,
    /// Size of the in-process pool started by the `sor` binary.
    pub ranks: usize,
    /// Clusters the in-process pool is spread over.
    pub clusters: usize,
    /// Run over the MPI world instead of an in-process pool.
    pub mpi: bool,
}

impl Default for SorConfig {
    fn default() -> Self {
        Self {
            n: DEFAULT_INTERIOR + 2,
            max_iters: 0,
            reduce_always: true,
            exchange: ExchangeMode::Sync,
            delivery: Delivery::Pull,
            iters_per_reduce: 1,
            reducer: ReducerStrategy::Tree,
            warmup: false,
            timings: false,
            ranks: 1,
            clusters: 1,
            mpi: false,
        }
    }
}

fn invalid(arg: &str, reason: impl Into<String>) -> SorError {
    SorError::InvalidArgument {
        arg: arg.to_owned(),
        reason: reason.into(),
    }
}

fn parse_count(flag: &str, value: Option<&String>) -> Result<usize, SorError> {
    let value = value.ok_or_else(|| invalid(flag, "missing value"))?;
    match value.parse::<usize>() {
        Ok(0) => Err(invalid(flag, "must be at least 1")),
        Ok(v) => Ok(v),
        Err(e) => Err(invalid(value, e.to_string())),
    }
}

impl SorConfig {
    /// Parse `[flags] <N> [<ITERATIONS>]` (program name excluded).
    ///
    /// `<N>` is the interior edge length; two boundary rows are added.
    pub fn from_args<I, S>(args: I) -> Result<Self, SorError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let mut cfg = Self::default();
        let mut positional = 0;
        let mut i = 0;
        while i < args.len() {
            let arg = args[i].as_str();
            match arg {
                "-warmup" => cfg.warmup = true,
                "-no-warmup" => cfg.warmup = false,
                "-reduce" => cfg.reduce_always = true,
                "-no-reduce" => cfg.reduce_always = false,
                "-async" => cfg.exchange = ExchangeMode::Async,
                "-sync" | "-no-sync" => cfg.exchange = ExchangeMode::Sync,
                "-upcall" => cfg.delivery = Delivery::Upcall,
                "-reduce-cluster" => cfg.reducer = ReducerStrategy::Cluster,
                "-mpi" => cfg.mpi = true,
                "-reduce-fac" => {
                    i += 1;
                    cfg.iters_per_reduce = parse_count(arg, args.get(i))?;
                }
                "-ranks" => {
                    i += 1;
                    cfg.ranks = parse_count(arg, args.get(i))?;
                }
                "-clusters" => {
                    i += 1;
                    cfg.clusters = parse_count(arg, args.get(i))?;
                }
                _ if arg.starts_with('-') => return Err(invalid(arg, "unknown option")),
                _ => {
                    let v: usize = arg.parse().map_err(|e| invalid(arg, format!("{e}")))?;
                    match positional {
                        0 => cfg.n = v.checked_add(2).ok_or_else(|| invalid(arg, "too large"))?,
                        1 => cfg.max_iters = v,
                        _ => return Err(invalid(arg, "unexpected extra argument")),
                    }
                    positional += 1;
                }
            }
            i += 1;
        }
        Ok(cfg)
    }

    /// Apply [`ENV_BCAST_LINEAR`] and [`ENV_TIMING`] as read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let truthy = |key: &str| {
            lookup(key).is_some_and(|v| matches!(v.trim(), "1" | "true" | "on" | "yes"))
        };
        if truthy(ENV_BCAST_LINEAR) && self.reducer == ReducerStrategy::Tree {
            self.reducer = ReducerStrategy::Linear;
        }
        if truthy(ENV_TIMING) {
            self.timings = true;
        }
    }

    /// [`apply_env`](Self::apply_env) against the process environment.
    pub fn with_process_env(mut self) -> Self {
        self.apply_env(|k| std::env::var(k).ok());
        self
    }

    /// Checks that need the pool size; run before any transport is opened.
    pub fn validate(&self, pool_size: usize) -> Result<(), SorError> {
        let interior = self.n.saturating_sub(2);
        if interior < pool_size {
            return Err(SorError::ProblemTooSmall {
                interior_rows: interior,
                ranks: pool_size,
            });
        }
        if self.max_iters == 0 && !self.reduce_always {
            return Err(SorError::MissingIterations);
        }
        if self.iters_per_reduce == 0 {
            return Err(SorError::Configuration("iters_per_reduce must be >= 1".into()));
        }
        Ok(())
    }

    /// Whether termination is decided by the global residual.
    pub fn is_dynamic(&self) -> bool {
        self.max_iters == 0
    }

    /// Label printed in the run banner.
    pub fn reduce_label(&self) -> &'static str {
        match (self.reducer, self.reduce_always) {
            (ReducerStrategy::Cluster, _) => "cluster",
            (_, true) => "on",
            (_, false) => "off",
        }
    }

    /// The run banner printed before the first solve on `ranks` ranks. Sizes
    /// are `N`, boundary rows included.
    pub fn banner(&self, ranks: usize) -> String {
        let iterations = if self.is_dynamic() {
            "dynamic".to_owned()
        } else {
            self.max_iters.to_string()
        };
        let params = SorParams::for_grid(self.n);
        format!(
            "Starting SOR\n\n\
             CPUs          : {ranks}\n\
             Matrix size   : {n}x{n}\n\
             Iterations    : {iterations}\n\
             Reduce        : {reduce}\n\n\
             Problem parameters\n\
             r       : {r}\n\
             omega   : {omega}\n\
             stopdiff: {stopdiff}\n",
            n = self.n,
            reduce = self.reduce_label(),
            r = params.r,
            omega = params.omega,
            stopdiff = params.stopdiff,
        )
    }

    pub fn usage() -> String {
        [
            "Usage: sor [options] {<N> {<ITERATIONS>}}",
            "",
            "N x N         : (int, int). Problem matrix size",
            "ITERATIONS    : (int). Number of iterations to calculate. 0 means dynamic termination detection.",
            "",
            "options: -warmup -no-warmup -reduce -no-reduce -async -sync -upcall",
            "         -reduce-fac <k> -reduce-cluster -ranks <P> -clusters <k> -mpi",
        ]
        .join("\n")
    }
}
