//! Temporary process resource limits for a long import.
//!
//! A worker raises its CPU-time and address-space soft limits to the hard
//! limits for the duration of a run and restores them when the guard drops,
//! whether the run finished or failed.

/// Restores the saved soft limits on drop.
pub struct LimitGuard {
    #[cfg(unix)]
    saved: Vec<(imp::Resource, libc::rlimit)>,
}

impl LimitGuard {
    /// A guard that changed nothing.
    pub fn disabled() -> Self {
        Self {
            #[cfg(unix)]
            saved: Vec::new(),
        }
    }

    /// Raises every supported soft limit to its hard limit.
    #[cfg(unix)]
    pub fn raise() -> Self {
        let saved = imp::RESOURCES
            .iter()
            .filter_map(|&(name, resource)| imp::raise(name, resource))
            .collect();
        Self { saved }
    }

    #[cfg(not(unix))]
    pub fn raise() -> Self {
        Self::disabled()
    }

    /// Number of limits that will be restored.
    pub fn raised_count(&self) -> usize {
        #[cfg(unix)]
        {
            self.saved.len()
        }
        #[cfg(not(unix))]
        {
            0
        }
    }
}

impl Drop for LimitGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        for (resource, previous) in self.saved.drain(..) {
            imp::restore(resource, &previous);
        }
    }
}

#[cfg(unix)]
mod imp {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    pub type Resource = libc::__rlimit_resource_t;
    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    pub type Resource = libc::c_int;

    pub const RESOURCES: &[(&str, Resource)] = &[
        ("cpu", libc::RLIMIT_CPU as Resource),
        ("address space", libc::RLIMIT_AS as Resource),
    ];

    fn current(resource: Resource) -> Option<libc::rlimit> {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: `limit` is a valid, writable rlimit for the duration of the call.
        let rc = unsafe { libc::getrlimit(resource, &mut limit) };
        (rc == 0).then_some(limit)
    }

    /// Returns the previous limit when it was changed.
    pub fn raise(name: &str, resource: Resource) -> Option<(Resource, libc::rlimit)> {
        let previous = current(resource)?;
        if previous.rlim_cur == previous.rlim_max {
            return None;
        }
        let raised = libc::rlimit {
            rlim_cur: previous.rlim_max,
            rlim_max: previous.rlim_max,
        };
        // SAFETY: `raised` is a valid rlimit that outlives the call.
        if unsafe { libc::setrlimit(resource, &raised) } != 0 {
            log::warn!(
                "Could not raise {} limit: {}",
                name,
                std::io::Error::last_os_error()
            );
            return None;
        }
        log::debug!("Raised {} soft limit for the import run", name);
        Some((resource, previous))
    }

    pub fn restore(resource: Resource, previous: &libc::rlimit) {
        // SAFETY: `previous` is a valid rlimit that outlives the call.
        if unsafe { libc::setrlimit(resource, previous) } != 0 {
            log::warn!(
                "Could not restore resource limit: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    #[cfg(test)]
    pub fn soft_limit(resource: Resource) -> Option<libc::rlim_t> {
        current(resource).map(|l| l.rlim_cur)
    }
}
