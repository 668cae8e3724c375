use crate::error::BandmonError;

/// Check that we are running as root. Attaching kprobes requires root.
pub fn check_root() -> Result<(), BandmonError> {
    if unsafe { libc::getuid() } != 0 {
        return Err(BandmonError::NotRoot);
    }
    Ok(())
}
