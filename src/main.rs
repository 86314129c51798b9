//! gantry CLI - distributed test orchestration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use tokio_util::sync::CancellationToken;

use gantry::batch::slurm::SlurmBatch;
use gantry::batch::{pack_jobs, run_batch, BatchParams};
use gantry::config::{self, RuntimeConfig};
use gantry::exec::pool::{run_pool, PoolParams};
use gantry::exec::TestExecList;
use gantry::exprs::WordExpression;
use gantry::filter;
use gantry::groups::ParamAnalyzeGroups;
use gantry::list::TestList;
use gantry::platform::create_platform;
use gantry::plugin::PluginSet;
use gantry::runner::local::ProcessGroups;
use gantry::scan::DirectoryScanner;
use gantry::timings::LookupCache;

#[derive(Parser)]
#[command(name = "gantry")]
#[command(about = "Distributed test orchestration", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(long, default_value = "gantry.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone)]
struct FilterArgs {
    /// Platform name (otherwise identified from the machine)
    #[arg(long = "plat")]
    plat: Option<String>,

    /// Platform options, key=value comma separated (repeatable)
    #[arg(long = "platopt")]
    platopt: Vec<String>,

    /// On options feeding option enable expressions (repeatable)
    #[arg(short = 'o')]
    on_options: Vec<String>,

    /// Off options (repeatable)
    #[arg(short = 'O')]
    off_options: Vec<String>,

    /// Keyword expression, e.g. "fast and not slow"
    #[arg(short = 'k', long = "keywords")]
    keyword_expr: Option<String>,

    /// Parameter expression over name=value words, e.g. "np=4 or np=8"
    #[arg(short = 'p', long = "params")]
    param_expr: Option<String>,

    /// Minimum prior runtime in seconds
    #[arg(long = "tmin")]
    runtime_min: Option<i64>,

    /// Maximum prior runtime in seconds
    #[arg(long = "tmax")]
    runtime_max: Option<i64>,

    /// Cumulative runtime budget in seconds
    #[arg(long = "tsum")]
    runtime_sum: Option<i64>,

    /// Include tests carrying the TDD keyword
    #[arg(long = "include-tdd")]
    include_tdd: bool,

    /// Content search regex; tests must match in a searched file
    /// (repeatable)
    #[arg(long = "search")]
    search: Vec<String>,

    /// Limit the run to a subdirectory of the scan tree
    subdir: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests
    Run {
        #[command(flatten)]
        filters: FilterArgs,

        /// Number of processors to use
        #[arg(short = 'n')]
        num_procs: Option<u32>,

        /// Maximum processors
        #[arg(short = 'N')]
        max_procs: Option<u32>,

        /// Number of devices to use
        #[arg(long)]
        devices: Option<u32>,

        /// Maximum devices
        #[arg(long)]
        max_devices: Option<u32>,

        /// Directory to scan for test sources
        #[arg(long, default_value = ".")]
        scan_dir: PathBuf,

        /// Directory tests execute under
        #[arg(long, default_value = "TestResults")]
        test_dir: PathBuf,

        /// Submit through the batch system instead of the local pool
        #[arg(long)]
        batch: bool,

        /// Run only analyze sections
        #[arg(long)]
        analyze_only: bool,

        /// Run baseline handling
        #[arg(long)]
        baseline: bool,

        /// Re-entrant mode: execute the tests of an existing list file
        #[arg(long)]
        test_list: Option<PathBuf>,

        /// Results suffix to write under (batch re-entry)
        #[arg(long)]
        results_suffix: Option<String>,
    },

    /// Discover and filter tests without running them
    Collect {
        #[command(flatten)]
        filters: FilterArgs,

        /// Directory to scan for test sources
        #[arg(long, default_value = ".")]
        scan_dir: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

fn build_runtime_config(filters: &FilterArgs, platform_name: &str) -> Result<RuntimeConfig> {
    let mut rtc = RuntimeConfig::new(platform_name);
    rtc.on_options = filters.on_options.clone();
    rtc.off_options = filters.off_options.clone();

    if let Some(expr) = &filters.keyword_expr {
        rtc.keyword_expr =
            Some(WordExpression::parse(expr).context("invalid keyword expression")?);
    }
    if let Some(expr) = &filters.param_expr {
        rtc.param_expr =
            Some(WordExpression::parse(expr).context("invalid parameter expression")?);
    }
    rtc.runtime_min = filters.runtime_min;
    rtc.runtime_max = filters.runtime_max;
    rtc.runtime_sum = filters.runtime_sum;
    rtc.include_tdd = filters.include_tdd;
    for pat in &filters.search {
        rtc.search_regexes
            .push(regex::Regex::new(pat).context("invalid search regex")?);
    }
    rtc.subdir = filters.subdir.clone();
    Ok(rtc)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            filters,
            num_procs,
            max_procs,
            devices,
            max_devices,
            scan_dir,
            test_dir,
            batch,
            analyze_only,
            baseline,
            test_list,
            results_suffix,
        } => {
            run_tests(RunArgs {
                config: cli.config,
                filters,
                num_procs,
                max_procs,
                devices,
                max_devices,
                scan_dir,
                test_dir,
                batch,
                analyze_only,
                baseline,
                test_list,
                results_suffix,
            })
            .await
        }
        Commands::Collect {
            filters,
            scan_dir,
            format,
        } => collect_tests(&cli.config, filters, &scan_dir, &format).await,
    }
}

struct RunArgs {
    config: PathBuf,
    filters: FilterArgs,
    num_procs: Option<u32>,
    max_procs: Option<u32>,
    devices: Option<u32>,
    max_devices: Option<u32>,
    scan_dir: PathBuf,
    test_dir: PathBuf,
    batch: bool,
    analyze_only: bool,
    baseline: bool,
    test_list: Option<PathBuf>,
    results_suffix: Option<String>,
}

async fn run_tests(args: RunArgs) -> Result<()> {
    let file_cfg = config::load_config(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let plugins = PluginSet::new();

    let platname = args
        .filters
        .plat
        .clone()
        .or_else(|| file_cfg.platform.clone());

    let mut rtc = build_runtime_config(&args.filters, platname.as_deref().unwrap_or(""))?;
    rtc.analyze_only = args.analyze_only;
    rtc.baseline = args.baseline;
    // a re-entrant run executes an already-filtered list
    rtc.include_all = args.test_list.is_some();

    let mut platopts: Vec<String> = Vec::new();
    for (k, v) in &file_cfg.platopts {
        platopts.push(format!("{}={}", k, v));
    }
    platopts.extend(args.filters.platopt.clone());

    let mut platform = create_platform(
        platname.as_deref(),
        &platopts,
        args.batch,
        args.num_procs,
        args.max_procs,
        args.devices,
        args.max_devices,
        &plugins,
        &rtc,
    )?;
    rtc.platform_name = platform.name().to_string();

    info!(
        "platform {} procs={:?} devices={:?}",
        platform.name(),
        platform.size().0,
        platform.size().1
    );

    // assemble the test list: fresh scan, or an existing list file
    let (mut tlist, restart) = match &args.test_list {
        Some(listfile) => {
            let mut tlist = TestList::new(Some(listfile.clone()));
            tlist.read_file().context("reading test list file")?;
            tlist.read_results().context("reading prior results")?;
            (tlist, true)
        }
        None => {
            std::fs::create_dir_all(&args.test_dir)
                .with_context(|| format!("creating {}", args.test_dir.display()))?;
            let mut tlist = TestList::new(Some(args.test_dir.join("testlist")));
            let scanner = DirectoryScanner::new();
            tlist
                .scan(&scanner, &args.scan_dir, platform.nodesize())
                .await
                .context("scanning for tests")?;
            (tlist, false)
        }
    };

    // runtime estimates from the timings databases
    let mut cache = LookupCache::new(
        platform.name(),
        platform.compiler(),
        platform.attrs().testing_directory().as_deref(),
    );
    tlist.attach_runtimes(&mut cache);

    // filter passes and dependency wiring
    let mut groups = ParamAnalyzeGroups::new();
    filter::apply_permanent_filters(&mut tlist, &mut groups, &rtc, &plugins);
    if restart || rtc.subdir.is_some() || rtc.baseline {
        filter::apply_restart_filters(&mut tlist, &mut groups, &rtc);
    }
    gantry::depend::connect_dependencies(&mut tlist, &groups);

    info!("{} active tests of {}", tlist.num_active(), tlist.len());

    if let Some(sfx) = args.results_suffix.clone() {
        tlist.set_results_suffix(Some(sfx));
    }
    tlist.set_results_suffix(None);
    tlist.write_file(true).context("writing test list")?;
    let results_file = tlist
        .initialize_results_file()
        .context("opening results file")?;
    info!("results file {}", results_file.display());

    let mut xlist = TestExecList::new();
    let default_timeout = file_cfg
        .test_timeout_secs
        .unwrap_or(gantry::exec::DEFAULT_TIMEOUT_SECS);
    xlist.generate_backlog(&tlist, default_timeout);

    let exit_code = if args.batch {
        run_batch_mode(&mut tlist, &mut xlist, &platform, &args).await?
    } else {
        run_pool_mode(
            &mut tlist,
            &mut xlist,
            &mut platform,
            &args,
            default_timeout,
            file_cfg.poll_interval_secs,
        )
        .await?
    };

    tlist.write_finished().context("finalizing results file")?;
    std::process::exit(exit_code);
}

async fn run_pool_mode(
    tlist: &mut TestList,
    xlist: &mut TestExecList,
    platform: &mut gantry::platform::Platform,
    args: &RunArgs,
    default_timeout: u64,
    poll_secs: Option<u64>,
) -> Result<i32> {
    let params = PoolParams {
        test_dir: args.test_dir.clone(),
        poll_interval: Duration::from_secs(poll_secs.unwrap_or(15)),
        default_timeout_secs: default_timeout,
        analyze_only: args.analyze_only,
        baseline: args.baseline,
    };

    let cancel = CancellationToken::new();
    let pgroups = ProcessGroups::new();

    // first interrupt stops launching; a second one takes the children
    // down by process group and exits
    {
        let cancel = cancel.clone();
        let pgroups = pgroups.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt: waiting for running tests (interrupt again to kill)");
                cancel.cancel();
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("second interrupt: terminating test process groups");
                    pgroups.terminate_all();
                    std::process::exit(1);
                }
            }
        });
    }

    let summary = run_pool(tlist, xlist, platform, &params, cancel, pgroups)
        .await
        .context("pool execution")?;

    info!(
        "done: {} pass, {} diff, {} fail, {} timeout, {} notrun",
        summary.num_pass,
        summary.num_diff,
        summary.num_fail,
        summary.num_timeout,
        summary.num_notrun
    );

    Ok(if summary.all_passed() { 0 } else { 1 })
}

async fn run_batch_mode(
    tlist: &mut TestList,
    xlist: &mut TestExecList,
    platform: &gantry::platform::Platform,
    args: &RunArgs,
) -> Result<i32> {
    let batchspec = platform
        .batchspec()
        .context("batch mode needs a batch system binding")?
        .clone();

    let attrs = platform.attrs();
    let suffix = tlist
        .results_suffix()
        .map(str::to_string)
        .unwrap_or_default();

    let mut params = BatchParams::new(batchspec.ppn, args.test_dir.join("batchset"));
    params.dpn = batchspec.dpn;
    params.max_concurrent = attrs.default_submit_limit();
    params.max_nodes = attrs.misc.get("max_nodes").and_then(|v| v.parse().ok());
    params.queue = attrs.queue.clone();
    params.account = attrs.account.clone();
    if let Some(wall) = &attrs.walltime {
        if let Some(secs) = parse_walltime(wall) {
            params.max_job_seconds = secs;
        }
    }
    params.harness_argv = vec![
        std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "gantry".to_string()),
        "run".to_string(),
        "--test-dir".to_string(),
        args.test_dir.display().to_string(),
    ];

    xlist.sort_by_size_and_timeout();
    let mut jobs = pack_jobs(xlist.backlog_mut(), &params, &suffix);
    for job in &jobs {
        tlist
            .add_include_file(&job.sub_list)
            .context("recording batch include")?;
    }

    let slurm = SlurmBatch::new(batchspec.ppn)
        .with_dpn(batchspec.dpn)
        .with_qos(attrs.qos.clone())
        .with_extra_flags(attrs.extra_flags.as_deref());

    let summary = run_batch(&mut jobs, tlist, &slurm, &params)
        .await
        .context("batch execution")?;

    info!(
        "batch done: {} jobs, {} submit failures, {} tests not run",
        summary.num_jobs, summary.num_submit_failures, summary.num_tests_notrun
    );

    let all_good = summary.num_submit_failures == 0
        && summary.num_tests_notrun == 0
        && tlist.cases().all(|c| {
            c.status().skip_test()
                || matches!(
                    c.status().result(),
                    Some(gantry::status::ResultKind::Pass) | None
                )
        });
    Ok(if all_good { 0 } else { 1 })
}

/// `H:MM:SS`, `M:SS`, or bare seconds.
fn parse_walltime(text: &str) -> Option<i64> {
    let parts: Vec<&str> = text.split(':').collect();
    let nums: Option<Vec<i64>> = parts.iter().map(|p| p.trim().parse().ok()).collect();
    let nums = nums?;
    match nums.as_slice() {
        [s] => Some(*s),
        [m, s] => Some(m * 60 + s),
        [h, m, s] => Some(h * 3600 + m * 60 + s),
        _ => None,
    }
}

async fn collect_tests(
    config_path: &Path,
    filters: FilterArgs,
    scan_dir: &Path,
    format: &str,
) -> Result<()> {
    let file_cfg = config::load_config(config_path)?;
    let plugins = PluginSet::new();

    let platname = filters.plat.clone().or(file_cfg.platform);
    let rtc_probe = build_runtime_config(&filters, platname.as_deref().unwrap_or(""))?;
    let (name, _cplr) = gantry::platform::determine_platform_and_compiler(
        platname.as_deref(),
        &plugins,
        &rtc_probe,
    );
    let rtc = build_runtime_config(&filters, &name)?;

    let mut tlist = TestList::new(None);
    let scanner = DirectoryScanner::new();
    tlist
        .scan(&scanner, scan_dir, None)
        .await
        .context("scanning for tests")?;

    let mut groups = ParamAnalyzeGroups::new();
    filter::apply_permanent_filters(&mut tlist, &mut groups, &rtc, &plugins);

    match format {
        "json" => {
            let entries: Vec<serde_json::Value> = tlist
                .active_cases()
                .map(|c| {
                    serde_json::json!({
                        "exec_dir": c.exec_dir(),
                        "name": c.spec().name(),
                        "parameters": c.spec().parameters(),
                        "keywords": c.spec().keywords(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            println!("{} active tests:", tlist.num_active());
            for case in tlist.active_cases() {
                println!("  {}", case.exec_dir());
            }
            let skipped: Vec<_> = tlist
                .cases()
                .filter(|c| c.status().skip_test())
                .collect();
            if !skipped.is_empty() {
                println!("{} skipped:", skipped.len());
                for case in skipped {
                    let reason = case
                        .status()
                        .skip_reason()
                        .map(|r| r.to_string())
                        .unwrap_or_default();
                    println!("  {} ({})", case.exec_dir(), reason);
                }
            }
        }
    }

    Ok(())
}
