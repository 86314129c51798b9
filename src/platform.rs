//! Platform binding: resource pools, attributes, batch system.
//!
//! A [`PlatformConfig`] is the mutable record handed to the platform
//! plugin at startup; once configuration settles it is frozen into a
//! [`Platform`], which owns the processor and device pools and grants
//! [`JobInfo`] allocations to launching tests.

use std::collections::BTreeMap;

use tracing::info;

use crate::config::{PlatformAttrs, RuntimeConfig};
use crate::plugin::{PluginOptions, PluginSet};
use crate::resources::ResourcePool;

/// The batch-system binding chosen by the plugin or the CLI: the system
/// type name plus the node shape.
#[derive(Debug, Clone)]
pub struct BatchSpec {
    pub system: String,
    pub ppn: u32,
    pub dpn: u32,
}

/// Mutable platform configuration, the interface the platform plugin
/// sees.
#[derive(Debug, Default)]
pub struct PlatformConfig {
    pub platname: String,
    pub cplrname: Option<String>,
    pub environ: BTreeMap<String, String>,
    pub attrs: PlatformAttrs,
    batchspec: Option<BatchSpec>,
}

impl PlatformConfig {
    pub fn new(platname: impl Into<String>, cplrname: Option<String>) -> Self {
        Self {
            platname: platname.into(),
            cplrname,
            ..Self::default()
        }
    }

    pub fn setenv(&mut self, name: &str, value: Option<&str>) {
        match value {
            Some(v) => {
                self.environ.insert(name.to_string(), v.to_string());
            }
            None => {
                self.environ.remove(name);
            }
        }
    }

    /// Binds a batch system. A `ppn` given via `--platopt` takes
    /// precedence over the plugin's value.
    ///
    /// # Panics
    ///
    /// Panics if `ppn` is zero.
    pub fn set_batch_system(&mut self, system: &str, ppn: u32) {
        assert!(ppn > 0, "ppn must be positive");
        let ppn = self.attrs.ppn.unwrap_or(ppn);
        let dpn = self.attrs.dpn.unwrap_or(0);
        self.batchspec = Some(BatchSpec {
            system: system.to_string(),
            ppn,
            dpn,
        });
        if self.attrs.ppn.is_none() {
            self.attrs.ppn = Some(ppn);
        }
    }

    pub fn batchspec(&self) -> Option<&BatchSpec> {
        self.batchspec.as_ref()
    }
}

/// A processor/device allocation granted to one launching test, returned
/// to the platform when the test stops.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub procs: Vec<usize>,
    pub maxprocs: usize,
    pub devices: Option<Vec<usize>>,
    pub maxdevices: Option<usize>,
    pub mpi_opts: String,
    /// Contents for a per-test machine file, when the mpifile attribute
    /// asks for one.
    pub machinefile: Option<String>,
}

/// The frozen platform: pools + attributes + optional batch binding.
#[derive(Debug)]
pub struct Platform {
    name: String,
    compiler: Option<String>,
    environ: BTreeMap<String, String>,
    attrs: PlatformAttrs,
    batchspec: Option<BatchSpec>,
    procpool: ResourcePool,
    devicepool: Option<ResourcePool>,
}

impl Platform {
    pub fn new(config: PlatformConfig) -> Self {
        Self {
            name: config.platname,
            compiler: config.cplrname,
            environ: config.environ,
            attrs: config.attrs,
            batchspec: config.batchspec,
            procpool: ResourcePool::new(1, 1),
            devicepool: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn compiler(&self) -> Option<&str> {
        self.compiler.as_deref()
    }

    pub fn attrs(&self) -> &PlatformAttrs {
        &self.attrs
    }

    pub fn environ(&self) -> &BTreeMap<String, String> {
        &self.environ
    }

    pub fn batchspec(&self) -> Option<&BatchSpec> {
        self.batchspec.as_ref()
    }

    /// Processors per node, when a batch system fixed the node shape.
    pub fn nodesize(&self) -> Option<u32> {
        self.batchspec.as_ref().map(|b| b.ppn).or(self.attrs.ppn)
    }

    /// Sizes the pools from the command line: `-n` / `-N` for
    /// processors, `--devices` / `--max-devices` for devices. Missing
    /// values fall back to plugin attributes, then to a probe of the
    /// machine.
    pub fn init_procs(
        &mut self,
        num_procs: Option<u32>,
        max_procs: Option<u32>,
        num_devices: Option<u32>,
        max_devices: Option<u32>,
    ) {
        let (np, maxnp) =
            determine_processor_cores(num_procs, max_procs, self.attrs.maxprocs);
        self.procpool = ResourcePool::new(np as usize, maxnp as usize);

        if let (Some(nd), Some(maxnd)) =
            determine_device_count(num_devices, max_devices, self.attrs.maxdevices)
        {
            self.devicepool = Some(ResourcePool::new(nd as usize, maxnd as usize));
        }

        info!(
            "platform {}: procs {}/{} devices {}",
            self.name,
            np,
            maxnp,
            self.devicepool
                .as_ref()
                .map(|d| format!("{}/{}", d.num_total(), d.max_available()))
                .unwrap_or_else(|| "none".to_string()),
        );
    }

    /// `(total procs, total devices)`.
    pub fn size(&self) -> (u32, u32) {
        (
            self.procpool.num_total() as u32,
            self.devicepool
                .as_ref()
                .map(|d| d.num_total() as u32)
                .unwrap_or(0),
        )
    }

    /// `(max procs, max devices)`.
    pub fn max_size(&self) -> (u32, u32) {
        (
            self.procpool.max_available() as u32,
            self.devicepool
                .as_ref()
                .map(|d| d.max_available() as u32)
                .unwrap_or(0),
        )
    }

    /// `(free procs, free devices)` this instant.
    pub fn size_available(&self) -> (u32, u32) {
        (
            self.procpool.num_available() as u32,
            self.devicepool
                .as_ref()
                .map(|d| d.num_available() as u32)
                .unwrap_or(0),
        )
    }

    /// Grants processors and, when requested and pooled, devices.
    pub fn get_resources(&mut self, np: u32, ndevice: Option<u32>) -> JobInfo {
        let procs = self.procpool.get(np as usize);

        let devices = match (&mut self.devicepool, ndevice) {
            (Some(pool), Some(nd)) => Some(pool.get(nd as usize)),
            _ => None,
        };

        construct_job_info(
            procs,
            &self.procpool,
            devices,
            self.devicepool.as_ref(),
            self.attrs.mpifile.as_deref().unwrap_or(""),
            self.attrs.mpiopts.as_deref().unwrap_or(""),
        )
    }

    pub fn return_resources(&mut self, job_info: JobInfo) {
        self.procpool.put(&job_info.procs);
        if let (Some(pool), Some(devices)) = (&mut self.devicepool, &job_info.devices) {
            pool.put(devices);
        }
    }
}

fn determine_processor_cores(
    num_procs: Option<u32>,
    max_procs: Option<u32>,
    plugin_max: Option<u32>,
) -> (u32, u32) {
    let mx = max_procs
        .or(plugin_max)
        .unwrap_or_else(|| probe_num_processors(4));
    let np = num_procs.unwrap_or(mx);
    (np, mx.max(np))
}

fn determine_device_count(
    num_devices: Option<u32>,
    max_devices: Option<u32>,
    plugin_max: Option<u32>,
) -> (Option<u32>, Option<u32>) {
    let mx = max_devices.or(plugin_max);
    match num_devices {
        Some(nd) => (Some(nd), Some(mx.unwrap_or(nd).max(nd))),
        None => (mx, mx),
    }
}

fn probe_num_processors(default: u32) -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(default)
}

fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn construct_job_info(
    procs: Vec<usize>,
    procpool: &ResourcePool,
    devices: Option<Vec<usize>>,
    devicepool: Option<&ResourcePool>,
    mpifile: &str,
    mpiopts: &str,
) -> JobInfo {
    let numprocs = procpool.num_total();
    let maxprocs = procpool.max_available();

    let mut job_info = JobInfo {
        procs,
        maxprocs,
        devices,
        maxdevices: devicepool.map(|p| p.max_available()),
        mpi_opts: String::new(),
        machinefile: None,
    };

    match mpifile {
        "hostfile" => {
            // OpenMPI style: one host line with a slot count
            job_info.mpi_opts = "--hostfile machinefile".to_string();
            let slots = job_info.procs.len().min(numprocs);
            job_info.machinefile = Some(format!("{} slots={}\n", local_hostname(), slots));
        }
        "machinefile" => {
            // MPICH style: one line per granted processor
            job_info.mpi_opts = "-machinefile machinefile".to_string();
            let host = local_hostname();
            let mut content = String::new();
            for _ in 0..job_info.procs.len() {
                content.push_str(&host);
                content.push('\n');
            }
            job_info.machinefile = Some(content);
        }
        _ => {}
    }

    if !mpiopts.is_empty() {
        if !job_info.mpi_opts.is_empty() {
            job_info.mpi_opts.push(' ');
        }
        job_info.mpi_opts.push_str(mpiopts);
    }

    job_info
}

/// Names the platform: the explicit `--plat` value, else the
/// identification plugin, else the operating system name.
pub fn determine_platform_and_compiler(
    platname: Option<&str>,
    plugins: &PluginSet,
    rtc: &RuntimeConfig,
) -> (String, Option<String>) {
    let opts = PluginOptions {
        platname: platname.map(str::to_string),
        on_options: rtc.on_options.clone(),
        off_options: rtc.off_options.clone(),
    };

    let name = platname
        .map(str::to_string)
        .or_else(|| plugins.idplatform().platform(&opts))
        .unwrap_or_else(os_platform_name);

    let compiler = plugins.idplatform().compiler(&name, &opts);

    (name, compiler)
}

fn os_platform_name() -> String {
    match std::env::consts::OS {
        "linux" => "Linux".to_string(),
        "macos" => "Darwin".to_string(),
        other => other.to_string(),
    }
}

/// Assembles the platform for a run: identification, `--platopt`
/// application, default batch binding for batch mode, plugin
/// initialization, then pool sizing.
#[allow(clippy::too_many_arguments)]
pub fn create_platform(
    platname: Option<&str>,
    platopt_args: &[String],
    batch_mode: bool,
    num_procs: Option<u32>,
    max_procs: Option<u32>,
    num_devices: Option<u32>,
    max_devices: Option<u32>,
    plugins: &PluginSet,
    rtc: &RuntimeConfig,
) -> Result<Platform, crate::config::ConfigError> {
    let (name, compiler) = determine_platform_and_compiler(platname, plugins, rtc);

    let mut platcfg = PlatformConfig::new(name, compiler);
    for arg in platopt_args {
        platcfg.attrs.apply_platopt_arg(arg)?;
    }

    if batch_mode {
        // a plain one-proc-per-node binding unless the plugin overrides
        platcfg.set_batch_system("procbatch", 1);
    }

    plugins.initialize_platform(&mut platcfg);

    let mut plat = Platform::new(platcfg);
    plat.init_procs(num_procs, max_procs, num_devices, max_devices);
    Ok(plat)
}
