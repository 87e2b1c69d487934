use std::io;
use std::ptr::NonNull;

use rdma_sys::*;

use crate::cm::CmId;

/// Protection domain.
pub struct Pd {
    pd: NonNull<ibv_pd>,
}

impl Pd {
    /// Allocate a protection domain on the device the id is bound to.
    pub fn alloc(id: &CmId) -> io::Result<Self> {
        // SAFETY: FFI; the id's verbs context is valid here.
        let pd = NonNull::new(unsafe { ibv_alloc_pd(id.verbs()) })
            .ok_or_else(io::Error::last_os_error)?;
        Ok(Self { pd })
    }

    pub(crate) fn as_raw(&self) -> *mut ibv_pd {
        self.pd.as_ptr()
    }
}

impl Drop for Pd {
    fn drop(&mut self) {
        // SAFETY: called once; all MRs and QPs on this PD are gone first.
        unsafe { ibv_dealloc_pd(self.as_raw()) };
    }
}
