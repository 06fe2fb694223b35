//! # Dispatcher
//!
//! The root task of the tunnel. It owns the service listeners and the
//! signal pipe, starts the call-home loops once, and hands every accepted
//! connection to the backend as a [`ConnectionTask`].
//!
//! ## Signals
//! - `SIGHUP`: re-read the configuration file; listeners whose address did
//!   not change keep their socket, so no pending connection is lost
//! - `SIGUSR1`: reopen the log file
//! - `SIGTERM`, `SIGINT`, `SIGQUIT`: stop accepting and return
//! - `SIGCHLD` (process backend): reap finished connection processes
//!
//! A failed reload keeps the running configuration.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::TunnelConfig;
use crate::error::{is_resource_exhaustion, Result};
use crate::poll::{HandleSet, Step, Task, Wake};
use crate::transport::socket::{bind_listener, prepare_stream};
use crate::utils::logging::reopen_log_file;

use super::backend::Backend;
use super::connection::ConnectionTask;
use super::signals::{SignalAction, SignalPipe};
use super::{Service, SharedState};

/// Pause before accepting again after the process ran out of descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

struct Listener {
    addr: String,
    socket: TcpListener,
    service: Arc<Service>,
}

/// Accept loop and signal handler of the tunnel
pub struct Dispatcher {
    config: TunnelConfig,
    config_path: Option<PathBuf>,
    listeners: Vec<Listener>,
    call_home: Vec<Arc<Service>>,
    call_home_started: bool,
    signals: SignalPipe,
    backend: Arc<dyn Backend>,
    shared: Arc<SharedState>,
    backoff_until: Option<Instant>,
}

impl Dispatcher {
    /// Build every service and bind its listener
    pub fn new(
        config: TunnelConfig,
        config_path: Option<PathBuf>,
        backend: Arc<dyn Backend>,
        shared: Arc<SharedState>,
        signals: SignalPipe,
    ) -> Result<Self> {
        let (listeners, call_home) = build_services(&config, &mut Vec::new())?;
        let dispatcher = Self {
            config,
            config_path,
            listeners,
            call_home,
            call_home_started: false,
            signals,
            backend,
            shared,
            backoff_until: None,
        };
        dispatcher.update_parent_fds();
        Ok(dispatcher)
    }

    /// Bound address of every listening service
    pub fn local_addrs(&self) -> Vec<(String, SocketAddr)> {
        self.listeners
            .iter()
            .filter_map(|l| {
                l.socket
                    .local_addr()
                    .ok()
                    .map(|addr| (l.service.name().to_string(), addr))
            })
            .collect()
    }

    /// Configuration currently in effect
    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    fn update_parent_fds(&self) {
        let mut fds: Vec<RawFd> = self.listeners.iter().map(|l| l.socket.as_raw_fd()).collect();
        fds.extend(self.signals.fds());
        self.backend.set_parent_fds(fds);
    }

    fn start_call_home(&mut self) {
        self.call_home_started = true;
        for service in &self.call_home {
            let slot = self.shared.admit();
            let task = ConnectionTask::call_home(service.clone(), self.shared.clone(), slot);
            match self.backend.spawn(Box::new(task)) {
                Ok(()) => info!(service = %service.name(), "Call-home service started"),
                Err(e) => error!(service = %service.name(), error = %e, "Failed to start call-home service"),
            }
        }
    }

    /// Handle queued signals; false once the tunnel must stop
    fn handle_signals(&mut self) -> bool {
        for action in self.signals.drain() {
            match action {
                SignalAction::Reload => self.reload(),
                SignalAction::ReopenLog => match reopen_log_file() {
                    Ok(true) => {}
                    Ok(false) => debug!("No log file to reopen"),
                    Err(e) => error!(error = %e, "Failed to reopen log file"),
                },
                SignalAction::Child => self.backend.reap(&self.shared),
                SignalAction::Terminate => {
                    info!("Terminated");
                    self.shared.metrics.log_metrics();
                    return false;
                }
            }
        }
        true
    }

    fn reload(&mut self) {
        let Some(path) = self.config_path.clone() else {
            info!("No configuration file to reload");
            return;
        };
        info!(path = %path.display(), "Reloading configuration");

        let config = match load_config(&path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "Reload failed: keeping the running configuration");
                return;
            }
        };

        match build_services(&config, &mut self.listeners) {
            Ok((listeners, call_home)) => {
                for removed in self.listeners.drain(..) {
                    info!(service = %removed.service.name(), addr = %removed.addr, "Listener closed");
                }
                self.listeners = listeners;
                if call_home.len() != self.call_home.len() {
                    warn!("Call-home services only change on restart");
                }
                if config.global.concurrency != self.config.global.concurrency {
                    warn!("Concurrency model only changes on restart");
                }
                self.shared.set_max_clients(config.global.max_clients);
                self.config = config;
                self.update_parent_fds();
                info!(services = self.config.services.len(), "Configuration reloaded");
            }
            Err(e) => error!(error = %e, "Reload failed: keeping the running configuration"),
        }
    }

    fn accept_one(&mut self, index: usize) {
        let service = self.listeners[index].service.clone();
        let (stream, peer) = loop {
            match self.listeners[index].socket.accept() {
                Ok(pair) => break pair,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if is_resource_exhaustion(&e) => {
                    warn!(service = %service.name(), error = %e, "Accept: temporary lack of resources");
                    self.shared.metrics.accept_error();
                    self.backoff_until = Some(Instant::now() + ACCEPT_BACKOFF);
                    return;
                }
                Err(e) => {
                    warn!(service = %service.name(), error = %e, "Accept failed");
                    self.shared.metrics.accept_error();
                    return;
                }
            }
        };

        if let Err(e) = prepare_stream(&stream) {
            warn!(service = %service.name(), peer = %peer, error = %e, "Failed to set socket options");
            return;
        }
        let Some(slot) = self.shared.try_admit() else {
            warn!(
                service = %service.name(),
                peer = %peer,
                max_clients = self.shared.max_clients(),
                "Connection rejected: too many clients"
            );
            self.shared.metrics.connection_rejected();
            return;
        };

        debug!(service = %service.name(), peer = %peer, clients = self.shared.clients(), "Dispatching connection");
        let task = ConnectionTask::accepted(service.clone(), self.shared.clone(), stream, peer, slot);
        if let Err(e) = self.backend.spawn(Box::new(task)) {
            error!(service = %service.name(), error = %e, "Failed to start connection");
        }
    }

    fn register(&mut self, handles: &mut HandleSet) -> Step {
        handles.init();
        handles.add(self.signals.fd(), true, false);

        if let Some(until) = self.backoff_until {
            let now = Instant::now();
            if now < until {
                return Step::Wait(Some(until - now));
            }
            self.backoff_until = None;
        }
        for listener in &self.listeners {
            handles.add(listener.socket.as_raw_fd(), true, false);
        }
        Step::Wait(None)
    }
}

impl Task for Dispatcher {
    fn step(&mut self, handles: &mut HandleSet, wake: Wake) -> Step {
        if let Wake::Failed(e) = wake {
            error!(error = %e, "Dispatcher wait failed");
            return Step::Done;
        }
        if !self.call_home_started {
            self.start_call_home();
        }

        if handles.can_read(self.signals.fd()) && !self.handle_signals() {
            return Step::Done;
        }

        if self.backoff_until.is_none() {
            let ready: Vec<usize> = (0..self.listeners.len())
                .filter(|&i| handles.can_read(self.listeners[i].socket.as_raw_fd()))
                .collect();
            for index in ready {
                if index < self.listeners.len() {
                    self.accept_one(index);
                }
            }
        }

        self.register(handles)
    }
}

fn load_config(path: &Path) -> Result<TunnelConfig> {
    let mut config = TunnelConfig::from_file(path)?;
    config.apply_env()?;
    config.validate_strict()?;
    Ok(config)
}

/// Build services for `config`, reusing listeners from `old` whose address
/// is unchanged. `old` is only touched once nothing can fail any more.
fn build_services(
    config: &TunnelConfig,
    old: &mut Vec<Listener>,
) -> Result<(Vec<Listener>, Vec<Arc<Service>>)> {
    let services = config
        .services
        .iter()
        .map(|settings| Service::from_config(settings).map(Arc::new))
        .collect::<Result<Vec<_>>>()?;

    let mut fresh: Vec<(usize, TcpListener)> = Vec::new();
    for (index, service) in services.iter().enumerate() {
        if let Some(addr) = &service.settings().accept {
            if !old.iter().any(|l| &l.addr == addr) {
                fresh.push((index, bind_listener(addr)?));
            }
        }
    }

    let mut listeners = Vec::new();
    let mut call_home = Vec::new();
    for (index, service) in services.into_iter().enumerate() {
        let Some(addr) = service.settings().accept.clone() else {
            if service.is_call_home() {
                call_home.push(service);
            }
            continue;
        };
        let socket = if let Some(pos) = fresh.iter().position(|(i, _)| *i == index) {
            fresh.swap_remove(pos).1
        } else if let Some(pos) = old.iter().position(|l| l.addr == addr) {
            old.swap_remove(pos).socket
        } else {
            continue;
        };
        info!(
            service = %service.name(),
            role = ?service.role(),
            addr = %addr,
            local = ?socket.local_addr().ok(),
            "Service listening"
        );
        listeners.push(Listener {
            addr,
            socket,
            service,
        });
    }
    Ok((listeners, call_home))
}
