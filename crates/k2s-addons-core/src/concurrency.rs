use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Exclusive advisory lock on the installed addon tree, released on drop.
pub struct AddonsLock {
    lock_file: File,
}

impl AddonsLock {
    pub fn acquire(lock_path: &Path) -> Result<Self, std::io::Error> {
        let file = open_lock_file(lock_path)?;
        file.lock_exclusive()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::WouldBlock, e))?;
        Ok(Self { lock_file: file })
    }

    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, std::io::Error> {
        let file = open_lock_file(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }
}

fn open_lock_file(lock_path: &Path) -> Result<File, std::io::Error> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)
}

impl Drop for AddonsLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// First Ctrl-C requests a cooperative stop; a second one exits.
pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(1);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\ncancellation requested, stopping after the current stage...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Cancellation flag polled between pipeline stages.
///
/// Clones share the flag. A token from [`Cancellation::from_signal`] also
/// reports cancelled once Ctrl-C has been pressed.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
    follow_signal: bool,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_signal() -> Self {
        Self {
            flag: Arc::default(),
            follow_signal: true,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || (self.follow_signal && shutdown_requested())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("addons/.addons.lock");

        {
            let _lock = AddonsLock::acquire(&lock_path).unwrap();
            assert!(lock_path.exists());
        }
    }

    #[test]
    fn try_acquire_returns_none_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join(".addons.lock");

        let _lock = AddonsLock::acquire(&lock_path).unwrap();
        assert!(AddonsLock::try_acquire(&lock_path).unwrap().is_none());
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join(".addons.lock");

        {
            let _lock = AddonsLock::acquire(&lock_path).unwrap();
        }
        assert!(AddonsLock::try_acquire(&lock_path).unwrap().is_some());
    }

    #[test]
    fn cancellation_is_shared_between_clones() {
        let token = Cancellation::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
