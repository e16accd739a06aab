use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::path::PathBuf;

use nix::unistd::Pid;

use crate::ContainerSpec;
use crate::Error;
use crate::Result;

/// Period against which the cpu.max quota is expressed, in microseconds.
const CPU_PERIOD_US: u32 = 100_000;

/// An owned cgroup-v2 directory with the container's child enrolled in it.
///
/// Created before networking (the child must already exist to be enrolled)
/// and removed after the child has been reaped, since only an empty cgroup
/// can be deleted.
#[derive(Debug)]
pub struct CgroupHandle {
    path: PathBuf,
}

/// Fail fast when a previous run's cgroup is still present.
///
/// Runs during validation, before the child is cloned; the directory-creation
/// step below catches the race where a concurrent run wins in between.
pub fn cgroup_preflight(spec: &ContainerSpec) -> Result<()> {
    if spec.cgroup_path.exists() {
        return Err(already_exists(&spec.cgroup_path));
    }
    Ok(())
}

/// Create the cgroup, apply the limits and enroll `child`.
///
/// An existing directory is a hard error: silently reusing another run's
/// cgroup would mix their processes. On any failure the directory is removed
/// again before the error is returned.
pub fn setup_cgroup(spec: &ContainerSpec, child: Pid) -> Result<CgroupHandle> {
    log::debug!("creating cgroup {}", spec.cgroup_path.display());
    let mut builder = fs::DirBuilder::new();
    builder.mode(0o755);
    builder.create(&spec.cgroup_path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::AlreadyExists {
            already_exists(&spec.cgroup_path)
        } else {
            cgroup_error("create", &spec.cgroup_path, source)
        }
    })?;
    let handle = CgroupHandle {
        path: spec.cgroup_path.clone(),
    };
    if let Err(e) = handle.apply(spec, child) {
        handle.cleanup();
        return Err(e);
    }
    Ok(handle)
}

impl CgroupHandle {
    fn apply(&self, spec: &ContainerSpec, child: Pid) -> Result<()> {
        self.write_control("memory.max", &spec.memory_max_bytes.to_string())?;
        self.write_control(
            "cpu.max",
            &format!("{} {}", spec.cpu_max_period_us, CPU_PERIOD_US),
        )?;
        self.write_control("cgroup.procs", &child.as_raw().to_string())?;
        Ok(())
    }

    fn write_control(&self, file: &'static str, value: &str) -> Result<()> {
        let path = self.path.join(file);
        log::debug!("writing {:?} to {}", value, path.display());
        fs::write(&path, value).map_err(|source| cgroup_error(file, &path, source))
    }

    /// Remove the cgroup directory. The child must have been reaped first.
    /// Idempotent.
    pub fn cleanup(&self) {
        match fs::remove_dir(&self.path) {
            Ok(()) => log::debug!("removed cgroup {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("failed to remove cgroup {}: {}", self.path.display(), e),
        }
    }
}

fn cgroup_error(operation: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::Cgroup {
        operation,
        path: path.to_path_buf(),
        source,
    }
}

fn already_exists(path: &Path) -> Error {
    cgroup_error(
        "create",
        path,
        std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "cgroup left over from another run",
        ),
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn spec_in(dir: &Path) -> ContainerSpec {
        let mut spec = ContainerSpec::new("ubuntu", vec!["/bin/sh".into()]);
        spec.cgroup_path = dir.join("mocker");
        spec.memory_max_bytes = 16 * 1024 * 1024;
        spec.cpu_max_period_us = 50_000;
        spec
    }

    #[test]
    fn limits_and_pid_are_written() {
        let workdir = tempfile::TempDir::new().unwrap();
        let spec = spec_in(workdir.path());
        setup_cgroup(&spec, Pid::from_raw(4321)).unwrap();
        let read = |file: &str| fs::read_to_string(spec.cgroup_path.join(file)).unwrap();
        assert_eq!(read("memory.max"), "16777216");
        assert_eq!(read("cpu.max"), "50000 100000");
        assert_eq!(read("cgroup.procs"), "4321");
    }

    #[test]
    fn existing_cgroup_is_rejected() {
        let workdir = tempfile::TempDir::new().unwrap();
        let spec = spec_in(workdir.path());
        fs::create_dir(&spec.cgroup_path).unwrap();
        assert!(matches!(cgroup_preflight(&spec), Err(Error::Cgroup { .. })));
        assert!(matches!(
            setup_cgroup(&spec, Pid::from_raw(1)),
            Err(Error::Cgroup { .. })
        ));
    }

    #[test]
    fn preflight_passes_on_a_clean_path() {
        let workdir = tempfile::TempDir::new().unwrap();
        cgroup_preflight(&spec_in(workdir.path())).unwrap();
    }

    #[test]
    fn cleanup_tolerates_a_missing_directory() {
        let workdir = tempfile::TempDir::new().unwrap();
        let handle = CgroupHandle {
            path: workdir.path().join("gone"),
        };
        handle.cleanup();
        handle.cleanup();
    }
}
