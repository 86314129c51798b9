//! # gantry
//!
//! A distributed test orchestration engine: gantry discovers a universe
//! of parameterized test cases, filters them against runtime criteria,
//! resolves the dependency graph among them, and schedules execution
//! across bounded processor and device resources - in-process as a pool
//! of concurrent workers, or packed into batch jobs for an external
//! resource manager.
//!
//! ## Architecture
//!
//! The engine is a dependency chain, leaves first:
//!
//! - [`resources`] - counted integer-id pools for processors and devices
//! - [`params`] - cartesian expansion of grouped/ungrouped parameter axes
//! - [`exprs`] - the word expressions gating tests on keywords,
//!   platforms, options, and dependency results
//! - [`spec`] / [`status`] / [`case`] - immutable test descriptions,
//!   mutable execution state, and the case that pairs them with
//!   dependency edges
//! - [`groups`] - parameterize/analyze grouping by source file and name
//! - [`filter`] - the permanent and restart filter passes
//! - [`depend`] - wildcard dependency resolution over execute directories
//! - [`list`] - the authoritative case registry plus the test-list file
//!   format with per-run result logs
//! - [`timings`] - historical runtime databases feeding the scheduler
//! - [`exec`] - the backlog, state tracking, and the pool scheduling loop
//! - [`platform`] - resource pools, attributes, and the batch binding
//! - [`runner`] - local and remote (SSH) subprocess execution
//! - [`jobrunner`] - general background jobs with log shipping
//! - [`batch`] - job packing, submit scripts, queue polling, and result
//!   reconciliation (Slurm bundled)
//!
//! ## Flow
//!
//! Scan, construct cases, permanent-filter, build groups, connect
//! dependencies, restart-filter, build the backlog, then either the
//! direct pool loop or the batch packer, and finally reconcile results.
//!
//! ```no_run
//! use gantry::config::RuntimeConfig;
//! use gantry::groups::ParamAnalyzeGroups;
//! use gantry::list::TestList;
//! use gantry::plugin::PluginSet;
//!
//! let mut tlist = TestList::new(Some("TestResults/testlist".into()));
//! // ... scan test sources into tlist ...
//!
//! let rtc = RuntimeConfig::new("Linux");
//! let plugins = PluginSet::new();
//! let mut groups = ParamAnalyzeGroups::new();
//! gantry::filter::apply_permanent_filters(&mut tlist, &mut groups, &rtc, &plugins);
//! gantry::depend::connect_dependencies(&mut tlist, &groups);
//! ```

pub mod batch;
pub mod case;
pub mod config;
pub mod depend;
pub mod exec;
pub mod exprs;
pub mod filter;
pub mod groups;
pub mod jobrunner;
pub mod list;
pub mod params;
pub mod platform;
pub mod plugin;
pub mod resources;
pub mod runner;
pub mod scan;
pub mod spec;
pub mod status;
pub mod timings;

// Re-export the types most callers need to assemble a run.

pub use case::TestCase;
pub use config::{PlatformAttrs, RuntimeConfig};
pub use exec::pool::{PoolParams, RunSummary};
pub use exec::TestExecList;
pub use list::TestList;
pub use params::ParameterSet;
pub use platform::Platform;
pub use plugin::PluginSet;
pub use resources::ResourcePool;
pub use spec::{SpecSource, TestSpec, TestSpecBuilder};
pub use status::{ResultKind, TestStatus};
