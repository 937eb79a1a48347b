//! Service management for the `dingd` daemon.
//!
//! Supports installation as a system service on Linux (systemd) and
//! macOS (launchd). Linux is the primary target: privilege-isolated
//! builds rely on a dedicated uid range and a root-owned control
//! process, which only systemd's service model is set up to supervise
//! in production.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "macos")]
mod macos;

/// Service name identifier.
pub const SERVICE_NAME: &str = "io.ding.dingd";

/// Service user name (reserved for future use when running as dedicated user).
#[allow(dead_code)]
pub const SERVICE_USER: &str = "ding";

/// Paths for service installation.
pub struct ServicePaths {
    /// Service definition file (systemd unit or launchd plist).
    pub service_file: PathBuf,
    /// Binary installation path.
    pub binary: PathBuf,
    /// Data directory.
    pub data_dir: PathBuf,
    /// Log directory.
    pub log_dir: PathBuf,
    /// Log file path.
    pub log_file: PathBuf,
    /// Configuration directory.
    pub config_dir: PathBuf,
    /// Environment file.
    pub env_file: PathBuf,
    /// Log rotation config.
    pub logrotate_config: PathBuf,
}

impl ServicePaths {
    #[cfg(target_os = "linux")]
    pub fn new() -> Self {
        Self {
            service_file: PathBuf::from("/etc/systemd/system/dingd.service"),
            binary: PathBuf::from("/usr/local/bin/dingd"),
            data_dir: PathBuf::from("/var/lib/ding"),
            log_dir: PathBuf::from("/var/log/ding"),
            log_file: PathBuf::from("/var/log/ding/dingd.log"),
            config_dir: PathBuf::from("/etc/ding"),
            env_file: PathBuf::from("/etc/ding/ding.env"),
            logrotate_config: PathBuf::from("/etc/logrotate.d/dingd"),
        }
    }

    #[cfg(target_os = "macos")]
    pub fn new() -> Self {
        Self {
            service_file: PathBuf::from("/Library/LaunchDaemons/io.ding.dingd.plist"),
            binary: PathBuf::from("/usr/local/bin/dingd"),
            data_dir: PathBuf::from("/var/lib/ding"),
            log_dir: PathBuf::from("/var/log/ding"),
            log_file: PathBuf::from("/var/log/ding/dingd.log"),
            config_dir: PathBuf::from("/etc/ding"),
            env_file: PathBuf::from("/etc/ding/ding.env"),
            logrotate_config: PathBuf::from("/etc/newsyslog.d/ding.conf"),
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    pub fn new() -> Self {
        // Fallback for unsupported platforms (won't work but allows compilation).
        Self {
            service_file: PathBuf::from("/tmp/dingd.service"),
            binary: PathBuf::from("/usr/local/bin/dingd"),
            data_dir: PathBuf::from("/var/lib/ding"),
            log_dir: PathBuf::from("/var/log/ding"),
            log_file: PathBuf::from("/var/log/ding/dingd.log"),
            config_dir: PathBuf::from("/etc/ding"),
            env_file: PathBuf::from("/etc/ding/ding.env"),
            logrotate_config: PathBuf::from("/tmp/ding.conf"),
        }
    }
}

impl Default for ServicePaths {
    fn default() -> Self {
        Self::new()
    }
}

/// Service status information.
#[derive(Debug)]
pub struct ServiceStatus {
    pub installed: bool,
    pub running: bool,
    pub pid: Option<u32>,
    pub binary_path: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    /// True if we couldn't query full status (needs sudo).
    pub needs_root_for_details: bool,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.installed {
            writeln!(f, "Status: Not installed")?;
            writeln!(f, "\nTo install: sudo dingd install")?;
            return Ok(());
        }

        writeln!(f, "Status: Installed")?;

        if self.needs_root_for_details {
            writeln!(f, "Running: Unknown (run with sudo for details)")?;
        } else if self.running {
            writeln!(f, "Running: Yes")?;
            if let Some(pid) = self.pid {
                writeln!(f, "PID: {}", pid)?;
            }
        } else {
            writeln!(f, "Running: No")?;
            writeln!(f, "\nTo start: sudo dingd start")?;
        }

        if let Some(ref path) = self.binary_path {
            writeln!(f, "Binary: {}", path.display())?;
        }

        if let Some(ref path) = self.log_path {
            writeln!(f, "Logs: {}", path.display())?;
        }

        Ok(())
    }
}

/// Check if running with root privileges.
pub fn require_root() -> Result<()> {
    if !is_root() {
        bail!("This command requires root privileges. Please run with sudo.");
    }
    Ok(())
}

/// Check if current user is root.
fn is_root() -> bool {
    // SAFETY: geteuid() is always safe to call on Unix systems.
    // It's a pure read-only system call that returns the effective user ID
    // with no side effects or memory access concerns.
    unsafe { libc::geteuid() == 0 }
}

/// Get the path to the currently running binary.
fn current_binary_path() -> Result<PathBuf> {
    std::env::current_exe().context("Failed to get current executable path")
}

/// Create a system user for the service (reserved for future use).
#[allow(dead_code)]
fn create_service_user() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        linux::create_user()
    }
    #[cfg(target_os = "macos")]
    {
        macos::create_user()
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        bail!("Service user creation only supported on Linux and macOS")
    }
}

/// Install dingd as a system service.
pub fn install(env_file: Option<PathBuf>, force: bool) -> Result<()> {
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    bail!("Service installation only supported on Linux and macOS");

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        require_root()?;

        let paths = ServicePaths::new();

        if paths.service_file.exists() && !force {
            bail!(
                "Service is already installed at {}. Use --force to reinstall.",
                paths.service_file.display()
            );
        }

        println!("Installing dingd as system service...\n");

        print!("Creating directories... ");
        create_directories(&paths)?;
        println!("done");

        print!("Installing binary to {}... ", paths.binary.display());
        copy_binary(&paths)?;
        println!("done");

        print!("Setting up environment file... ");
        setup_env_file(&paths, env_file)?;
        println!("done");

        #[cfg(target_os = "linux")]
        {
            print!("Writing service definition... ");
            linux::write_unit(&paths)?;
            println!("done");

            print!("Configuring log rotation... ");
            linux::write_logrotate_config(&paths)?;
            println!("done");

            print!("Enabling service... ");
            linux::enable_service()?;
            println!("done");
        }

        #[cfg(target_os = "macos")]
        {
            print!("Writing service definition... ");
            macos::write_plist(&paths)?;
            println!("done");

            print!("Configuring log rotation... ");
            macos::write_newsyslog_config(&paths)?;
            println!("done");

            print!("Enabling service... ");
            macos::load_service(&paths)?;
            println!("done");
        }

        println!("\nInstallation complete!");
        println!("\nNext steps:");
        println!("  1. Edit configuration: sudo nano {}", paths.env_file.display());
        println!("  2. Start the service: sudo dingd start");
        println!("  3. Check status: dingd status");
        println!("  4. View logs: dingd logs -f");

        Ok(())
    }
}

/// Uninstall the system service.
pub fn uninstall(purge: bool) -> Result<()> {
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    bail!("Service management only supported on Linux and macOS");

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        require_root()?;

        let paths = ServicePaths::new();

        if !paths.service_file.exists() {
            bail!("Service is not installed");
        }

        println!("Uninstalling dingd system service...\n");

        print!("Stopping service... ");
        #[cfg(target_os = "linux")]
        let _ = linux::stop_service();
        #[cfg(target_os = "macos")]
        let _ = macos::stop_service(&paths);
        println!("done");

        print!("Disabling service... ");
        #[cfg(target_os = "linux")]
        linux::disable_service()?;
        #[cfg(target_os = "macos")]
        macos::unload_service(&paths)?;
        println!("done");

        print!("Removing service definition... ");
        if paths.service_file.exists() {
            std::fs::remove_file(&paths.service_file)?;
        }
        println!("done");

        print!("Removing log rotation config... ");
        if paths.logrotate_config.exists() {
            let _ = std::fs::remove_file(&paths.logrotate_config);
        }
        println!("done");

        if purge {
            print!("Removing binary... ");
            if paths.binary.exists() {
                std::fs::remove_file(&paths.binary)?;
            }
            println!("done");

            print!("Removing data directory... ");
            if paths.data_dir.exists() {
                std::fs::remove_dir_all(&paths.data_dir)?;
            }
            println!("done");

            print!("Removing log directory... ");
            if paths.log_dir.exists() {
                std::fs::remove_dir_all(&paths.log_dir)?;
            }
            println!("done");

            print!("Removing config directory... ");
            if paths.config_dir.exists() {
                std::fs::remove_dir_all(&paths.config_dir)?;
            }
            println!("done");
        }

        println!("\nUninstallation complete!");
        if !purge {
            println!("\nNote: Data, logs, and configuration were preserved.");
            println!("To remove everything, run: sudo dingd uninstall --purge");
        }

        Ok(())
    }
}

/// Start the service.
pub fn start() -> Result<()> {
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    bail!("Service management only supported on Linux and macOS");

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        let paths = ServicePaths::new();

        if !paths.service_file.exists() {
            bail!("Service is not installed. Run 'sudo dingd install' first.");
        }

        require_root()?;

        println!("Starting dingd service...");
        #[cfg(target_os = "linux")]
        linux::start_service()?;
        #[cfg(target_os = "macos")]
        macos::start_service(&paths)?;
        println!("Service started.");

        Ok(())
    }
}

/// Stop the service.
pub fn stop() -> Result<()> {
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    bail!("Service management only supported on Linux and macOS");

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        let paths = ServicePaths::new();

        if !paths.service_file.exists() {
            bail!("Service is not installed.");
        }

        require_root()?;

        println!("Stopping dingd service...");
        #[cfg(target_os = "linux")]
        linux::stop_service()?;
        #[cfg(target_os = "macos")]
        macos::stop_service(&paths)?;
        println!("Service stopped.");

        Ok(())
    }
}

/// Restart the service.
pub fn restart() -> Result<()> {
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    bail!("Service management only supported on Linux and macOS");

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        let paths = ServicePaths::new();

        if !paths.service_file.exists() {
            bail!("Service is not installed. Run 'sudo dingd install' first.");
        }

        require_root()?;

        println!("Restarting dingd service...");
        #[cfg(target_os = "linux")]
        {
            linux::stop_service()?;
            std::thread::sleep(std::time::Duration::from_secs(1));
            linux::start_service()?;
        }
        #[cfg(target_os = "macos")]
        {
            macos::stop_service(&paths)?;
            std::thread::sleep(std::time::Duration::from_secs(1));
            macos::start_service(&paths)?;
        }
        println!("Service restarted.");

        Ok(())
    }
}

/// Show service status.
pub fn status() -> Result<()> {
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    bail!("Service management only supported on Linux and macOS");

    #[cfg(target_os = "linux")]
    {
        let paths = ServicePaths::new();
        let status = linux::get_status(&paths)?;
        print!("{}", status);
        Ok(())
    }

    #[cfg(target_os = "macos")]
    {
        let paths = ServicePaths::new();
        let status = macos::get_status(&paths)?;
        print!("{}", status);
        Ok(())
    }
}

/// View service logs.
pub fn logs(lines: usize, follow: bool) -> Result<()> {
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    bail!("Service management only supported on Linux and macOS");

    #[cfg(target_os = "linux")]
    {
        let paths = ServicePaths::new();
        linux::view_logs(&paths, lines, follow)
    }

    #[cfg(target_os = "macos")]
    {
        let paths = ServicePaths::new();
        macos::view_logs(&paths, lines, follow)
    }
}

// Helper functions

fn create_directories(paths: &ServicePaths) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    for dir in [&paths.data_dir, &paths.log_dir, &paths.config_dir] {
        if !dir.exists() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
    }

    // Set appropriate permissions (owned by root, as daemon runs as root).
    std::fs::set_permissions(&paths.data_dir, std::fs::Permissions::from_mode(0o755))?;
    std::fs::set_permissions(&paths.log_dir, std::fs::Permissions::from_mode(0o755))?;
    std::fs::set_permissions(&paths.config_dir, std::fs::Permissions::from_mode(0o755))?;

    Ok(())
}

fn copy_binary(paths: &ServicePaths) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let current = current_binary_path()?;

    std::fs::copy(&current, &paths.binary)
        .with_context(|| format!("Failed to copy binary to {}", paths.binary.display()))?;

    std::fs::set_permissions(&paths.binary, std::fs::Permissions::from_mode(0o755))?;

    Ok(())
}

fn setup_env_file(paths: &ServicePaths, env_file: Option<PathBuf>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let db_path = paths.data_dir.join("ding.db");
    let absolute_db_url = format!("sqlite:{}", db_path.display());

    let source = if let Some(ref path) = env_file {
        if path.exists() {
            Some(path.clone())
        } else {
            bail!("Specified env file does not exist: {}", path.display());
        }
    } else {
        let cwd_env = std::env::current_dir()?.join(".env");
        if cwd_env.exists() {
            Some(cwd_env)
        } else {
            None
        }
    };

    if let Some(source) = source {
        let content = std::fs::read_to_string(&source)?;

        let mut lines: Vec<String> = content.lines().map(String::from).collect();
        let mut found_db_url = false;

        for line in &mut lines {
            if line.starts_with("DATABASE_URL=") {
                *line = format!("DATABASE_URL={}", absolute_db_url);
                found_db_url = true;
            }
        }

        if !found_db_url {
            lines.insert(0, format!("DATABASE_URL={}", absolute_db_url));
        }

        std::fs::write(&paths.env_file, lines.join("\n") + "\n")?;
    } else if !paths.env_file.exists() {
        let content = format!(
            r#"# Ding Server Configuration
# Generated by dingd install

# Path to the JSON deployment configuration (see Config::load).
DING_CONFIG={config_dir}/ding.json

# Database location (SQLite)
DATABASE_URL=sqlite:{data_dir}/ding.db

# Address the HTTP/RPC surface listens on
# DING_LISTEN=127.0.0.1:8080

# Logging level
RUST_LOG=ding_server=info,ding_core=info
"#,
            config_dir = paths.config_dir.display(),
            data_dir = paths.data_dir.display(),
        );
        std::fs::write(&paths.env_file, content)?;
    }

    // Set permissions: readable only by root (contains secrets).
    std::fs::set_permissions(&paths.env_file, std::fs::Permissions::from_mode(0o600))?;

    Ok(())
}
