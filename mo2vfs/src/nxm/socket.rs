//! Local socket plumbing for `nxm://` URL hand-off.
//!
//! A second app instance launched by the URL-scheme handler forwards the URL
//! as one line to the socket of the running instance and exits. The running
//! instance listens, parses each line and dispatches valid links; invalid
//! lines are logged and skipped.

use std::env;
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::link::NxmLink;

const SOCKET_NAME: &str = "mo2-nxm.sock";
const SEND_TIMEOUT: Duration = Duration::from_millis(1500);

/// The per-user socket path: `$XDG_RUNTIME_DIR/mo2-nxm.sock`, falling back
/// to `/tmp/mo2-nxm.sock`.
pub fn socket_path() -> PathBuf {
    match env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join(SOCKET_NAME),
        _ => Path::new("/tmp").join(SOCKET_NAME),
    }
}

/// Forward one URL line to the running instance.
pub fn send_url(url: &str) -> io::Result<()> {
    send_url_to(&socket_path(), url)
}

/// Forward one URL line to the socket at `path`.
pub fn send_url_to(path: &Path, url: &str) -> io::Result<()> {
    let mut stream = UnixStream::connect(path)?;
    stream.set_write_timeout(Some(SEND_TIMEOUT))?;
    stream.write_all(url.as_bytes())?;
    stream.write_all(b"\n")?;
    debug!("nxm url forwarded to '{}'", path.display());
    Ok(())
}

/// The listening side, owned by the running instance.
///
/// The accept loop runs on a background thread for the life of the process;
/// dropping the listener removes the socket file so a later instance can
/// rebind.
pub struct NxmListener {
    path: PathBuf,
}

impl NxmListener {
    /// Bind at the default socket path.
    pub fn start<F>(on_link: F) -> io::Result<Self>
    where
        F: Fn(NxmLink) + Send + 'static,
    {
        Self::start_at(socket_path(), on_link)
    }

    /// Bind at `path`, removing any leftover socket file first.
    pub fn start_at<F>(path: PathBuf, on_link: F) -> io::Result<Self>
    where
        F: Fn(NxmLink) + Send + 'static,
    {
        // A previous instance may have crashed without cleanup.
        if path.exists() {
            let _ = fs::remove_file(&path);
        }

        let listener = UnixListener::bind(&path)?;
        info!("nxm listener started on '{}'", path.display());

        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => handle_connection(stream, &on_link),
                    Err(e) => {
                        warn!("nxm listener accept failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(NxmListener { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for NxmListener {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn handle_connection<F>(stream: UnixStream, on_link: &F)
where
    F: Fn(NxmLink),
{
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let Ok(line) = line else { return };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match NxmLink::parse(line) {
            Ok(link) => on_link(link),
            Err(e) => warn!("invalid nxm url on socket ({}): {}", e, line),
        }
    }
}
