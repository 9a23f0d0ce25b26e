use crate::{
    config::{EngineConfig, InterpreterConfig, ProcessLimits},
    engine::{
        BackendCapabilities, ExitInfo, IsolationBackend, LaunchSpec, MemorySample,
        SandboxHandle, SpawnedSandbox,
    },
    errors::{EngineError, Result},
    sandboxed::ScratchWorkspace,
    types::Language,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Reference backend: one OS process per run, confined by rlimits, its own
/// process group, a scratch working directory and a cleared environment. On
/// Linux kernels with Landlock the program's filesystem is limited to its
/// scratch directory plus read-only runtime paths.
pub struct ProcessBackend {
    interpreters: Vec<InterpreterConfig>,
    scratch_base: PathBuf,
    limits: ProcessLimits,
    filesystem_confinement: bool,
}

/// Paths a confined program may use
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
#[derive(Debug, Clone)]
struct Confinement {
    scratch: PathBuf,
    read_only: Vec<PathBuf>,
}

impl ProcessBackend {
    pub fn new(config: &EngineConfig) -> Self {
        #[cfg(target_os = "linux")]
        let filesystem_confinement = crate::confine::supported();
        #[cfg(not(target_os = "linux"))]
        let filesystem_confinement = false;

        if !filesystem_confinement {
            warn!(
                "[SANDBOX] Landlock unavailable, programs can reach host paths outside \
                 their scratch directory"
            );
        }

        Self {
            interpreters: config.interpreters.clone(),
            scratch_base: config
                .scratch_base
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join("codeexec-scratch")),
            limits: config.process_limits.clone(),
            filesystem_confinement,
        }
    }

    /// What the program may touch, or `None` when the host cannot confine it
    fn confinement_for(
        &self,
        program: &Path,
        workspace: &ScratchWorkspace,
    ) -> Result<Option<Confinement>> {
        if !self.filesystem_confinement {
            if self.limits.require_filesystem_confinement {
                return Err(EngineError::Backend(
                    "filesystem confinement is required but Landlock is unavailable".to_string(),
                ));
            }
            return Ok(None);
        }

        let mut read_only = self.limits.read_only_paths.clone();
        #[cfg(target_os = "linux")]
        read_only.extend(crate::confine::install_prefixes(program));
        #[cfg(not(target_os = "linux"))]
        let _ = program;

        Ok(Some(Confinement {
            scratch: workspace.path().to_path_buf(),
            read_only,
        }))
    }

    /// Locate the interpreter executable for `language`
    pub fn resolve_interpreter(&self, language: Language) -> Result<(PathBuf, &[String])> {
        let interpreter = self
            .interpreters
            .iter()
            .find(|i| i.language == language)
            .ok_or_else(|| EngineError::InterpreterNotFound(language.to_string()))?;
        let path = which::which(&interpreter.program)
            .map_err(|_| EngineError::InterpreterNotFound(interpreter.program.clone()))?;
        Ok((path, &interpreter.args))
    }

    fn build_command(
        &self,
        program: &Path,
        args: &[String],
        program_file: &Path,
        workspace: &ScratchWorkspace,
    ) -> Command {
        let threads = self.limits.max_threads.to_string();
        let host_path =
            std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string());

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(program_file)
            .current_dir(workspace.path())
            .env_clear()
            .env("PATH", host_path)
            .env("LANG", "C.UTF-8")
            .env("HOME", workspace.path())
            .env("TMPDIR", workspace.path())
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONNOUSERSITE", "1")
            .env("OMP_NUM_THREADS", &threads)
            .env("OPENBLAS_NUM_THREADS", &threads)
            .env("MKL_NUM_THREADS", &threads)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Apply resource limits and filesystem confinement to the command
    #[cfg(unix)]
    fn apply_resource_limits(
        &self,
        cmd: &mut Command,
        spec: &LaunchSpec,
        confinement: Option<Confinement>,
    ) {
        use nix::sys::resource::Resource;

        let cpu_seconds = spec.timeout.as_secs_f64().ceil() as u64 + self.limits.cpu_grace_secs;
        let max_file_size = self.limits.max_file_size_bytes;
        #[cfg(target_os = "linux")]
        let memory_bytes = spec.memory_limit_bytes;
        #[cfg(target_os = "linux")]
        let max_processes = self.limits.max_processes;
        #[cfg(not(target_os = "linux"))]
        let _ = confinement;

        unsafe {
            cmd.pre_exec(move || {
                // New process group so the whole tree can be killed at once
                libc::setpgid(0, 0);

                // Allocates, so before RLIMIT_AS applies to the forked image
                #[cfg(target_os = "linux")]
                if let Some(confinement) = &confinement {
                    let status =
                        crate::confine::restrict_to(&confinement.scratch, &confinement.read_only)?;
                    if status == landlock::RulesetStatus::NotEnforced {
                        return Err(std::io::Error::other(
                            "filesystem confinement was not enforced",
                        ));
                    }
                }

                #[cfg(target_os = "linux")]
                {
                    // EPERM without CAP_SYS_ADMIN; network modules are still blocked by policy
                    let _ = nix::sched::unshare(nix::sched::CloneFlags::CLONE_NEWNET);

                    set_limit(Resource::RLIMIT_AS, memory_bytes, memory_bytes)?;
                    set_limit(Resource::RLIMIT_NPROC, max_processes, max_processes)?;
                }

                // SIGXCPU at the soft limit, SIGKILL one second later
                set_limit(Resource::RLIMIT_CPU, cpu_seconds, cpu_seconds + 1)?;
                set_limit(Resource::RLIMIT_FSIZE, max_file_size, max_file_size)?;
                set_limit(Resource::RLIMIT_CORE, 0, 0)?;

                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    fn apply_resource_limits(
        &self,
        _cmd: &mut Command,
        _spec: &LaunchSpec,
        _confinement: Option<Confinement>,
    ) {
        // Only the wall-clock and memory sampling of the governor apply
    }
}

/// Lower a limit, never asking for more than the current hard limit
#[cfg(unix)]
fn set_limit(resource: nix::sys::resource::Resource, soft: u64, hard: u64) -> std::io::Result<()> {
    use nix::sys::resource::{getrlimit, setrlimit};

    let (_, current_hard) = getrlimit(resource)?;
    let hard = (hard as libc::rlim_t).min(current_hard);
    let soft = (soft as libc::rlim_t).min(hard);
    setrlimit(resource, soft, hard)?;
    Ok(())
}

#[async_trait]
impl IsolationBackend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    fn capabilities(&self) -> BackendCapabilities {
        let confined = self.filesystem_confinement;
        BackendCapabilities {
            name: if confined {
                "OS process (rlimits + process group + landlock)"
            } else {
                "OS process (rlimits + process group)"
            }
            .to_string(),
            memory_sampling: cfg!(target_os = "linux"),
            network_isolation: false,
            group_kill: cfg!(unix),
            filesystem_confinement: confined,
            security_level: if confined { 8 } else { 6 },
        }
    }

    async fn spawn(&self, spec: &LaunchSpec) -> Result<SpawnedSandbox> {
        let (program, args) = self.resolve_interpreter(spec.language)?;
        let workspace = ScratchWorkspace::new(&self.scratch_base, spec.execution_id)?;
        let program_file = workspace.write_program(
            &format!("main.{}", spec.language.file_extension()),
            &spec.source,
        )?;

        let confinement = self.confinement_for(&program, &workspace)?;
        let mut cmd = self.build_command(&program, args, &program_file, &workspace);
        self.apply_resource_limits(&mut cmd, spec, confinement);

        let mut child = cmd.spawn().map_err(|e| {
            EngineError::Backend(format!("failed to start {}: {}", program.display(), e))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Backend("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Backend("stderr was not captured".to_string()))?;
        let pid = child.id();

        debug!(
            "[SANDBOX] {} started {} as pid {:?}",
            spec.execution_id,
            program.display(),
            pid
        );

        Ok(SpawnedSandbox {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            handle: Box::new(ProcessHandle {
                child: Mutex::new(child),
                pid,
                _workspace: workspace,
            }),
        })
    }
}

struct ProcessHandle {
    child: Mutex<Child>,
    pid: Option<u32>,
    // Removed when the handle is dropped, after the process is gone
    _workspace: ScratchWorkspace,
}

impl ProcessHandle {
    #[cfg(unix)]
    fn kill_group(&self) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return Ok(());
        };
        match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(EngineError::Backend(format!(
                "failed to kill process group {}: {}",
                pid, e
            ))),
        }
    }

    #[cfg(not(unix))]
    fn kill_group(&self) -> Result<()> {
        match self.child.try_lock() {
            Ok(mut child) => child.start_kill().map_err(EngineError::from),
            // A pending wait holds the lock; kill_on_drop reaps it
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl SandboxHandle for ProcessHandle {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&self) -> Result<ExitInfo> {
        let mut child = self.child.lock().await;
        let status = child.wait().await?;

        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Ok(ExitInfo {
            code: status.code(),
            signal,
        })
    }

    fn kill(&self) -> Result<()> {
        self.kill_group()
    }

    fn resident_memory(&self) -> Option<MemorySample> {
        #[cfg(target_os = "linux")]
        {
            let status = std::fs::read_to_string(format!("/proc/{}/status", self.pid?)).ok()?;
            parse_proc_status(&status)
        }
        #[cfg(not(target_os = "linux"))]
        {
            None
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // Background processes the program left in its group
        let _ = self.kill_group();
    }
}

/// `VmRSS`, `VmHWM` and `VmPeak` from `/proc/<pid>/status`. A zombie has no
/// `VmRSS`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_status(status: &str) -> Option<MemorySample> {
    let field = |name: &str| {
        status
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
            .map(|kb| kb * 1024)
    };
    Some(MemorySample {
        resident_bytes: field("VmRSS:")?,
        peak_bytes: field("VmHWM:"),
        address_space_bytes: field("VmPeak:"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proc_status() {
        let status = "Name:\tpython3\nVmPeak:\t  30000 kB\nVmHWM:\t   12000 kB\nVmRSS:\t   11000 kB\n";
        let sample = parse_proc_status(status).unwrap();
        assert_eq!(sample.resident_bytes, 11000 * 1024);
        assert_eq!(sample.peak_bytes, Some(12000 * 1024));
        assert_eq!(sample.address_space_bytes, Some(30000 * 1024));

        assert!(parse_proc_status("Name:\tzombie\nState:\tZ (zombie)\n").is_none());
    }

    #[test]
    fn test_capabilities_report_confinement() {
        let backend = ProcessBackend::new(&EngineConfig::default());
        let capabilities = backend.capabilities();
        assert_eq!(capabilities.filesystem_confinement, backend.filesystem_confinement);
        assert_eq!(
            capabilities.name.contains("landlock"),
            capabilities.filesystem_confinement
        );
    }

    #[test]
    fn test_required_confinement_without_landlock_refuses() {
        let mut config = EngineConfig::default();
        config.process_limits.require_filesystem_confinement = true;
        let mut backend = ProcessBackend::new(&config);
        backend.filesystem_confinement = false;

        let base = tempfile::tempdir().unwrap();
        let workspace =
            ScratchWorkspace::new(base.path(), crate::types::ExecutionId::new()).unwrap();
        assert!(matches!(
            backend.confinement_for(Path::new("/usr/bin/python3"), &workspace),
            Err(EngineError::Backend(_))
        ));

        config.process_limits.require_filesystem_confinement = false;
        let mut backend = ProcessBackend::new(&config);
        backend.filesystem_confinement = true;
        let confinement = backend
            .confinement_for(Path::new("/usr/bin/python3"), &workspace)
            .unwrap()
            .unwrap();
        assert_eq!(confinement.scratch, workspace.path());
        assert!(confinement.read_only.contains(&PathBuf::from("/usr")));
    }

    #[test]
    fn test_missing_interpreter() {
        let mut config = EngineConfig::default();
        config.set_interpreter(InterpreterConfig::new(
            Language::Graph,
            "definitely-not-an-installed-runtime",
            &[],
        ));
        let backend = ProcessBackend::new(&config);
        assert!(matches!(
            backend.resolve_interpreter(Language::Graph),
            Err(EngineError::InterpreterNotFound(_))
        ));
    }
}
