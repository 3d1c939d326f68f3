use std::path::PathBuf;

pub const DAEMON_TCP_PORT: u16 = 9877;

const DAEMON_TCP_HOST: &str = "127.0.0.1";

pub fn daemon_address() -> String {
    format!("{}:{}", DAEMON_TCP_HOST, DAEMON_TCP_PORT)
}

pub fn data_dir() -> PathBuf {
    // ~/.local/share/fmradio/ (XDG standard)
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".local")
        .join("share")
        .join("fmradio")
}

pub fn config_dir() -> PathBuf {
    // Always ~/.config/fmradio/, even where the OS suggests elsewhere
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("fmradio")
}

fn amixer_binary_names() -> &'static [&'static str] {
    &["amixer"]
}

fn dbus_send_binary_names() -> &'static [&'static str] {
    &["dbus-send"]
}

fn find_on_path(names: &[&str]) -> Option<PathBuf> {
    let path = std::env::var("PATH").ok()?;
    for dir in path.split(':') {
        for name in names {
            let p = PathBuf::from(dir).join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }
    None
}

/// Find the ALSA `amixer` tool used to flip mixer controls.
/// `AMIXER_PATH` overrides the PATH search.
pub fn find_amixer_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("AMIXER_PATH") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }
    find_on_path(amixer_binary_names())
}

/// Find `dbus-send`, used to ask the enabler service for tuner access.
pub fn find_dbus_send_binary() -> Option<PathBuf> {
    find_on_path(dbus_send_binary_names())
}
