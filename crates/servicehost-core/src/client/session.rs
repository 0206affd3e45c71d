//! Client side of connecting to the daemon.
//!
//! # Flow
//!
//! ```text
//! check markers -> connect -+-> send CreateSession -> await response
//!                           |
//!                           +-> (first failure) launch daemon
//!                           +-> retry with backoff until the deadline
//! ```
//!
//! The daemon is launched at most once per attempt, and the connect
//! deadline is measured from that launch. If it exits with the
//! killswitch code its version is marked blacklisted and the attempt fails
//! without further retries.

use crate::config::{BackoffPolicy, PathsConfig, SessionConfig};
use crate::error::{ErrorCode, ServiceFailure};
use crate::ipc::{Channel, ChannelEvent, Query, Value};
use crate::{HostError, Result};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Where one installed version of the platform lives.
///
/// ```text
/// <product_dir>/
///   <version>/
///     installed | disabled | blacklisted | killswitch
///     servicehostd.sock
///     services/
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    pub product_dir: PathBuf,
    pub version: String,
}

impl InstallLayout {
    pub fn new(product_dir: impl Into<PathBuf>, version: impl Into<String>) -> Self {
        Self {
            product_dir: product_dir.into(),
            version: version.into(),
        }
    }

    pub fn version_dir(&self) -> PathBuf {
        self.product_dir.join(&self.version)
    }

    pub fn services_dir(&self) -> PathBuf {
        self.version_dir().join(PathsConfig::SERVICES_DIR_NAME)
    }

    fn marker(&self, name: &str) -> PathBuf {
        self.version_dir().join(name)
    }

    pub fn is_installed(&self) -> bool {
        self.marker(PathsConfig::INSTALLED_MARKER).exists()
    }

    pub fn is_disabled(&self) -> bool {
        self.marker(PathsConfig::DISABLED_MARKER).exists()
    }

    pub fn is_blacklisted(&self) -> bool {
        self.marker(PathsConfig::BLACKLISTED_MARKER).exists()
    }

    pub fn has_killswitch(&self) -> bool {
        self.marker(PathsConfig::KILLSWITCH_MARKER).exists()
    }

    /// Address the daemon of this version listens on.
    #[cfg(unix)]
    pub fn daemon_address(&self) -> String {
        self.marker(PathsConfig::DAEMON_SOCKET_NAME)
            .to_string_lossy()
            .into_owned()
    }

    #[cfg(windows)]
    pub fn daemon_address(&self) -> String {
        crate::ipc::named_address(&format!("servicehostd-{}", self.version))
    }

    /// The newest installed version under the product directory, if any.
    pub fn newest_installed(&self) -> Option<String> {
        installed_versions(&self.product_dir).into_iter().next()
    }

    /// Take this version out of service for good.
    pub fn mark_blacklisted(&self) -> Result<()> {
        let installed = self.marker(PathsConfig::INSTALLED_MARKER);
        if installed.exists() {
            fs::remove_file(&installed).map_err(|e| HostError::io_with_path(e, &installed))?;
        }
        let blacklisted = self.marker(PathsConfig::BLACKLISTED_MARKER);
        fs::write(&blacklisted, b"").map_err(|e| HostError::io_with_path(e, &blacklisted))
    }
}

/// A launched daemon process.
pub trait DaemonProcess: Send {
    /// Exit status code, once the process has exited.
    fn exit_code(&mut self) -> Option<i32>;
}

impl DaemonProcess for tokio::process::Child {
    fn exit_code(&mut self) -> Option<i32> {
        match self.try_wait() {
            Ok(Some(status)) => status.code(),
            Ok(None) => None,
            Err(e) => {
                warn!("failed to check daemon status: {}", e);
                None
            }
        }
    }
}

/// Starts the daemon for an install.
pub trait DaemonLauncher: Send + Sync {
    fn launch(&self, layout: &InstallLayout) -> Result<Box<dyn DaemonProcess>>;
}

/// Launches the daemon executable as a detached child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    daemon_path: PathBuf,
    extra_args: Vec<OsString>,
}

impl ProcessLauncher {
    pub fn new(daemon_path: impl Into<PathBuf>) -> Self {
        Self {
            daemon_path: daemon_path.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.extra_args.push(arg.into());
        self
    }
}

impl DaemonLauncher for ProcessLauncher {
    fn launch(&self, layout: &InstallLayout) -> Result<Box<dyn DaemonProcess>> {
        let child = tokio::process::Command::new(&self.daemon_path)
            .arg("--product-dir")
            .arg(&layout.product_dir)
            .arg("--version")
            .arg(&layout.version)
            .args(&self.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| HostError::SpawnFailed {
                path: self.daemon_path.clone(),
                message: e.to_string(),
            })?;
        info!("launched daemon {} (pid {:?})", self.daemon_path.display(), child.id());
        Ok(Box::new(child))
    }
}

/// What a client tells the daemon about itself.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub layout: InstallLayout,
    pub backoff: BackoffPolicy,
    pub uri: String,
    pub locale: String,
    pub user_agent: String,
    pub client_pid: u32,
}

impl SessionOptions {
    pub fn new(layout: InstallLayout, uri: impl Into<String>) -> Self {
        Self {
            layout,
            backoff: BackoffPolicy::default(),
            uri: uri.into(),
            locale: "en".to_string(),
            user_agent: String::new(),
            client_pid: std::process::id(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_client_pid(mut self, pid: u32) -> Self {
        self.client_pid = pid;
        self
    }
}

fn session_error(code: ErrorCode, message: impl Into<String>) -> HostError {
    HostError::Session {
        code,
        message: message.into(),
    }
}

/// Runs the connect handshake against one install.
pub struct SessionCreator {
    options: SessionOptions,
    launcher: Arc<dyn DaemonLauncher>,
}

impl SessionCreator {
    pub fn new(options: SessionOptions, launcher: Arc<dyn DaemonLauncher>) -> Self {
        Self { options, launcher }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Connect, launching the daemon if needed, and open a session.
    pub async fn create_session(&self) -> Result<Channel> {
        self.check_install()?;
        let mut start = Instant::now();
        let mut channel = self.connect(&mut start).await?;
        match self.open_session(&mut channel, start).await {
            Ok(()) => Ok(channel),
            Err(e) => {
                channel.disconnect().await;
                Err(e)
            }
        }
    }

    fn check_install(&self) -> Result<()> {
        let layout = &self.options.layout;
        if !layout.is_installed() {
            return Err(match layout.newest_installed() {
                Some(newer) => {
                    info!("platform {} not installed, {} is", layout.version, newer);
                    session_error(ErrorCode::SwitchVersion, newer)
                }
                None => session_error(
                    ErrorCode::NotInstalled,
                    format!("no installed platform under {}", layout.product_dir.display()),
                ),
            });
        }
        if layout.is_disabled() {
            return Err(session_error(
                ErrorCode::PlatformDisabled,
                format!("platform {} is disabled", layout.version),
            ));
        }
        Ok(())
    }

    /// The deadline clock in `start` restarts once the daemon is launched.
    async fn connect(&self, start: &mut Instant) -> Result<Channel> {
        let layout = &self.options.layout;
        let backoff = &self.options.backoff;
        let address = layout.daemon_address();
        let mut daemon: Option<Box<dyn DaemonProcess>> = None;
        let mut attempt = 0u32;

        loop {
            let error = match Channel::connect(&address).await {
                Ok(channel) => {
                    debug!("connected to daemon at {} after {:?}", address, start.elapsed());
                    return Ok(channel);
                }
                Err(e) => e,
            };

            match daemon.as_mut() {
                None => {
                    debug!("daemon not reachable ({}), launching it", error);
                    daemon = Some(self.launcher.launch(layout).map_err(|e| {
                        session_error(ErrorCode::SpawnFailed, e.to_string())
                    })?);
                    *start = Instant::now();
                }
                Some(process) => {
                    if process.exit_code() == Some(SessionConfig::KILLSWITCH_EXIT_CODE) {
                        warn!("daemon {} exited with killswitch code, blacklisting", layout.version);
                        if let Err(e) = layout.mark_blacklisted() {
                            warn!("failed to blacklist {}: {}", layout.version, e);
                        }
                        return Err(session_error(
                            ErrorCode::PlatformBlacklisted,
                            format!("platform {} is blacklisted", layout.version),
                        ));
                    }
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= backoff.deadline {
                return Err(session_error(
                    ErrorCode::ConnectionFailure,
                    format!("daemon did not accept a connection within {:?}", backoff.deadline),
                ));
            }
            let delay = backoff.calculate_delay(attempt).min(backoff.deadline - elapsed);
            attempt += 1;
            tokio::time::sleep(delay).await;
        }
    }

    async fn open_session(&self, channel: &mut Channel, start: Instant) -> Result<()> {
        let o = &self.options;
        let query = Query::new(SessionConfig::CREATE_SESSION_COMMAND).with_payload(
            Value::map()
                .with("uri", o.uri.as_str())
                .with("locale", o.locale.as_str())
                .with("userAgent", o.user_agent.as_str())
                .with("clientPid", o.client_pid),
        );
        if !channel.send_query(&query) {
            return Err(session_error(ErrorCode::ConnectionFailure, "failed to send CreateSession"));
        }

        let remaining = o.backoff.deadline.saturating_sub(start.elapsed());
        let wait = if remaining.is_zero() {
            o.backoff.max_period
        } else {
            remaining
        };
        match tokio::time::timeout(wait, channel.next_event()).await {
            Err(_) => Err(session_error(ErrorCode::ConnectionFailure, "daemon non-responsive")),
            Ok(None) | Ok(Some(ChannelEvent::Ended { .. })) => Err(session_error(
                ErrorCode::ConnectionFailure,
                "daemon ended the connection",
            )),
            Ok(Some(ChannelEvent::Response(r)))
                if r.response_to == query.id && r.command == query.command =>
            {
                let payload = r.payload.unwrap_or_default();
                match payload.get_bool("success") {
                    Some(true) => {
                        info!("session created with daemon {}", o.layout.version);
                        Ok(())
                    }
                    Some(false) => {
                        let failure = ServiceFailure::from_strings(
                            payload.get_str("error"),
                            payload.get_str("verboseError"),
                        );
                        Err(session_error(failure.code, failure.to_string()))
                    }
                    None => Err(session_error(
                        ErrorCode::ProtocolError,
                        "CreateSession response without 'success'",
                    )),
                }
            }
            Ok(Some(other)) => Err(session_error(
                ErrorCode::ProtocolError,
                format!("unexpected reply to CreateSession: {:?}", other),
            )),
        }
    }
}

/// Exit code the daemon should use at startup, if it must not run.
pub fn killswitch_exit_code(layout: &InstallLayout) -> Option<i32> {
    layout
        .has_killswitch()
        .then_some(SessionConfig::KILLSWITCH_EXIT_CODE)
}

/// Version directory names that carry an installed marker, newest first.
pub fn installed_versions(product_dir: &Path) -> Vec<String> {
    let mut versions: Vec<_> = fs::read_dir(product_dir)
        .into_iter()
        .flatten()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().join(PathsConfig::INSTALLED_MARKER).exists())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            semver::Version::parse(&name).ok().map(|v| (v, name))
        })
        .collect();
    versions.sort_by(|a, b| b.0.cmp(&a.0));
    versions.into_iter().map(|(_, name)| name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::ChannelServer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct FakeProcess(Option<i32>);

    impl DaemonProcess for FakeProcess {
        fn exit_code(&mut self) -> Option<i32> {
            self.0
        }
    }

    #[derive(Default)]
    struct CountingLauncher {
        launches: AtomicUsize,
        exit_code: Option<i32>,
    }

    impl DaemonLauncher for CountingLauncher {
        fn launch(&self, _layout: &InstallLayout) -> Result<Box<dyn DaemonProcess>> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeProcess(self.exit_code)))
        }
    }

    fn install(tmp: &TempDir, version: &str) -> InstallLayout {
        let layout = InstallLayout::new(tmp.path(), version);
        fs::create_dir_all(layout.version_dir()).unwrap();
        fs::write(layout.version_dir().join(PathsConfig::INSTALLED_MARKER), b"").unwrap();
        layout
    }

    fn quick(layout: InstallLayout) -> SessionOptions {
        SessionOptions::new(layout, "test://client").with_backoff(
            BackoffPolicy::default()
                .with_initial(Duration::from_millis(10))
                .with_max_period(Duration::from_millis(50))
                .with_deadline(Duration::from_millis(300)),
        )
    }

    fn code_of(result: Result<Channel>) -> ErrorCode {
        match result {
            Err(HostError::Session { code, .. }) => code,
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("expected a failure"),
        }
    }

    #[tokio::test]
    async fn test_install_markers_fail_fast() {
        let tmp = TempDir::new().unwrap();
        let launcher = Arc::new(CountingLauncher::default());

        let missing = InstallLayout::new(tmp.path(), "1.0.0");
        let creator = SessionCreator::new(quick(missing.clone()), launcher.clone());
        assert_eq!(code_of(creator.create_session().await), ErrorCode::NotInstalled);

        install(&tmp, "2.1.0");
        install(&tmp, "2.0.3");
        assert_eq!(missing.newest_installed().as_deref(), Some("2.1.0"));
        match creator.create_session().await {
            Err(HostError::Session { code, message }) => {
                assert_eq!(code, ErrorCode::SwitchVersion);
                assert_eq!(message, "2.1.0");
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }

        let disabled = install(&tmp, "3.0.0");
        fs::write(disabled.version_dir().join(PathsConfig::DISABLED_MARKER), b"").unwrap();
        let creator = SessionCreator::new(quick(disabled), launcher.clone());
        assert_eq!(code_of(creator.create_session().await), ErrorCode::PlatformDisabled);

        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_absent_daemon_launched_once_then_deadline() {
        let tmp = TempDir::new().unwrap();
        let layout = install(&tmp, "1.0.0");
        let launcher = Arc::new(CountingLauncher::default());
        let creator = SessionCreator::new(quick(layout), launcher.clone());

        let started = std::time::Instant::now();
        assert_eq!(code_of(creator.create_session().await), ErrorCode::ConnectionFailure);
        let elapsed = started.elapsed();

        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert!(elapsed >= Duration::from_millis(300), "gave up after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "gave up after {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_killswitch_exit_blacklists() {
        let tmp = TempDir::new().unwrap();
        let layout = install(&tmp, "1.0.0");
        let launcher = Arc::new(CountingLauncher {
            exit_code: Some(SessionConfig::KILLSWITCH_EXIT_CODE),
            ..Default::default()
        });
        let creator = SessionCreator::new(quick(layout.clone()), launcher.clone());

        assert_eq!(code_of(creator.create_session().await), ErrorCode::PlatformBlacklisted);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert!(layout.is_blacklisted());
        assert!(!layout.is_installed());
    }

    struct SlowLauncher(Duration);

    impl DaemonLauncher for SlowLauncher {
        fn launch(&self, _layout: &InstallLayout) -> Result<Box<dyn DaemonProcess>> {
            std::thread::sleep(self.0);
            Ok(Box::new(FakeProcess(None)))
        }
    }

    #[tokio::test]
    async fn test_deadline_restarts_after_launch() {
        let tmp = TempDir::new().unwrap();
        let layout = install(&tmp, "1.0.0");
        let launcher = Arc::new(SlowLauncher(Duration::from_millis(250)));
        let creator = SessionCreator::new(quick(layout), launcher);

        let started = std::time::Instant::now();
        assert_eq!(code_of(creator.create_session().await), ErrorCode::ConnectionFailure);
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(550), "gave up after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "gave up after {:?}", elapsed);
    }

    /// A daemon stand-in that answers CreateSession with `reply`, or never
    /// answers when `reply` is `None`.
    fn fake_daemon(layout: &InstallLayout, reply: Option<Value>) -> tokio::task::JoinHandle<Value> {
        let mut server = ChannelServer::start(&layout.daemon_address()).unwrap();
        tokio::spawn(async move {
            let mut channel = server.next_channel().await.unwrap();
            let Some(ChannelEvent::Query(query)) = channel.next_event().await else {
                panic!("expected CreateSession");
            };
            if let Some(reply) = reply {
                channel.send_response(&query.response().with_payload(reply));
            }
            while let Some(event) = channel.next_event().await {
                if matches!(event, ChannelEvent::Ended { .. }) {
                    break;
                }
            }
            query.payload.unwrap_or_default()
        })
    }

    #[tokio::test]
    async fn test_session_created() {
        let tmp = TempDir::new().unwrap();
        let layout = install(&tmp, "1.0.0");
        let daemon = fake_daemon(&layout, Some(Value::map().with("success", true)));
        let launcher = Arc::new(CountingLauncher::default());
        let options = quick(layout).with_locale("fr").with_client_pid(77);
        let creator = SessionCreator::new(options, launcher.clone());

        let mut channel = creator.create_session().await.unwrap();
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
        channel.disconnect().await;

        let sent = daemon.await.unwrap();
        assert_eq!(sent.get_str("uri"), Some("test://client"));
        assert_eq!(sent.get_str("locale"), Some("fr"));
        assert_eq!(sent.get_i64("clientPid"), Some(77));
    }

    #[tokio::test]
    async fn test_session_refused_or_unanswered() {
        let tmp = TempDir::new().unwrap();
        let layout = install(&tmp, "1.0.0");
        let launcher = Arc::new(CountingLauncher::default());

        let _daemon = fake_daemon(
            &layout,
            Some(Value::map().with("success", false).with("error", "BP.permissionsError")),
        );
        let creator = SessionCreator::new(quick(layout.clone()), launcher.clone());
        assert_eq!(code_of(creator.create_session().await), ErrorCode::PermissionsError);

        let quiet = install(&tmp, "1.0.1");
        let _silent = fake_daemon(&quiet, None);
        let creator = SessionCreator::new(quick(quiet), launcher.clone());
        assert_eq!(code_of(creator.create_session().await), ErrorCode::ConnectionFailure);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_killswitch_marker() {
        let tmp = TempDir::new().unwrap();
        let layout = install(&tmp, "1.0.0");
        assert_eq!(killswitch_exit_code(&layout), None);
        fs::write(layout.version_dir().join(PathsConfig::KILLSWITCH_MARKER), b"").unwrap();
        assert_eq!(killswitch_exit_code(&layout), Some(42));
    }
}
