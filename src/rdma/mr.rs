use std::alloc::{self, Layout};
use std::ffi::c_void;
use std::io;
use std::ops::BitOr;
use std::ptr::{self, NonNull};

use rdma_sys::*;

use super::pd::Pd;

/// Buffer alignment: one page.
pub const BUF_ALIGN: usize = 4096;

/// Memory region access permissions.
#[derive(Clone, Copy, Debug)]
#[repr(transparent)]
pub struct Permission(ibv_access_flags);

impl Permission {
    pub const LOCAL_WRITE: Self = Self(ibv_access_flags::IBV_ACCESS_LOCAL_WRITE);
    pub const REMOTE_READ: Self = Self(ibv_access_flags::IBV_ACCESS_REMOTE_READ);
    pub const REMOTE_WRITE: Self = Self(ibv_access_flags::IBV_ACCESS_REMOTE_WRITE);
    pub const REMOTE_ATOMIC: Self = Self(ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC);

    pub fn contains(self, other: Self) -> bool {
        self.0 .0 & other.0 .0 == other.0 .0
    }
}

impl BitOr for Permission {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl From<Permission> for i32 {
    fn from(p: Permission) -> Self {
        p.0 .0 as _
    }
}

/// A page-aligned, zero-initialized heap buffer shared with the RDMA NIC.
///
/// Once registered, the NIC reads and writes this memory outside the
/// compiler's view, so observation goes through volatile reads. The buffer
/// must outlive the memory region registered on it; the session guarantees
/// this by drop order.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
}

impl AlignedBuf {
    pub fn zeroed(len: usize) -> io::Result<Self> {
        let layout = Layout::from_size_align(len, BUF_ALIGN)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: `len` is non-zero for every operation variant.
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "buffer allocation failed"))?;
        Ok(Self { ptr, len })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Volatile read of the leading 8 bytes as a native-order counter.
    pub fn read_u64(&self) -> u64 {
        debug_assert!(self.len >= 8);
        // SAFETY: in bounds; volatile because the NIC writes concurrently.
        unsafe { ptr::read_volatile(self.ptr.as_ptr().cast::<u64>()) }
    }

    /// Volatile byte-wise copy of the whole buffer.
    ///
    /// The copy is not atomic with respect to an in-flight RDMA write; a
    /// torn snapshot is possible and accepted (see the write demo notes).
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for i in 0..self.len {
            // SAFETY: in bounds; volatile because the NIC writes concurrently.
            out.push(unsafe { ptr::read_volatile(self.ptr.as_ptr().add(i)) });
        }
        out
    }

    /// Overwrite the buffer with a NUL-padded text message. Text longer
    /// than the buffer is truncated, always leaving a terminating NUL.
    pub fn write_message(&mut self, text: &str) {
        let bytes = text.as_bytes();
        let n = bytes.len().min(self.len - 1);
        // SAFETY: in bounds; the NIC never writes buffers we author locally.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr(), n);
            ptr::write_bytes(self.ptr.as_ptr().add(n), 0, self.len - n);
        }
    }

    /// The buffer content up to the first NUL, as text.
    pub fn text(&self) -> String {
        let snap = self.snapshot();
        let end = snap.iter().position(|&b| b == 0).unwrap_or(snap.len());
        String::from_utf8_lossy(&snap[..end]).into_owned()
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len, BUF_ALIGN)
            .expect("layout was validated at construction");
        // SAFETY: allocated with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
    }
}

/// Remote-access descriptor of a registered memory region.
///
/// Produced once per session after registration, immutable, and exchanged
/// verbatim over the side channel. A peer must target the pair it received
/// from the other side's registration, never its own.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MrDescriptor {
    pub rkey: u32,
    pub addr: u64,
}

impl MrDescriptor {
    /// Exact on-wire size: no padding, unlike the in-memory layout of the
    /// equivalent C struct.
    pub const WIRE_LEN: usize = 12;

    /// Encode as exactly 12 little-endian bytes: `rkey` then `addr`.
    pub fn to_wire(&self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[..4].copy_from_slice(&self.rkey.to_le_bytes());
        out[4..].copy_from_slice(&self.addr.to_le_bytes());
        out
    }

    pub fn from_wire(wire: &[u8; Self::WIRE_LEN]) -> Self {
        let mut rkey = [0u8; 4];
        let mut addr = [0u8; 8];
        rkey.copy_from_slice(&wire[..4]);
        addr.copy_from_slice(&wire[4..]);
        Self {
            rkey: u32::from_le_bytes(rkey),
            addr: u64::from_le_bytes(addr),
        }
    }
}

/// Local memory region.
pub struct Mr {
    mr: NonNull<ibv_mr>,
}

impl Mr {
    /// Register the buffer against the protection domain with the given
    /// access rights. Registration failure is fatal for the run.
    pub fn reg(pd: &Pd, buf: &AlignedBuf, perm: Permission) -> io::Result<Self> {
        // SAFETY: FFI; the buffer outlives the region (session drop order).
        let mr = unsafe {
            ibv_reg_mr(
                pd.as_raw(),
                buf.as_ptr() as *mut c_void,
                buf.len(),
                perm.into(),
            )
        };
        let mr = NonNull::new(mr).ok_or_else(io::Error::last_os_error)?;
        Ok(Self { mr })
    }

    /// Local key, used only in local-side scatter/gather entries.
    pub fn lkey(&self) -> u32 {
        // SAFETY: the `ibv_mr` instance is valid.
        unsafe { (*self.mr.as_ptr()).lkey }
    }

    /// Remote key, exported to the peer.
    pub fn rkey(&self) -> u32 {
        // SAFETY: the `ibv_mr` instance is valid.
        unsafe { (*self.mr.as_ptr()).rkey }
    }

    pub fn addr(&self) -> u64 {
        // SAFETY: the `ibv_mr` instance is valid.
        unsafe { (*self.mr.as_ptr()).addr as u64 }
    }

    pub fn len(&self) -> usize {
        // SAFETY: the `ibv_mr` instance is valid.
        unsafe { (*self.mr.as_ptr()).length as usize }
    }

    /// The descriptor the peer needs to target this region.
    pub fn descriptor(&self) -> MrDescriptor {
        MrDescriptor {
            rkey: self.rkey(),
            addr: self.addr(),
        }
    }

    /// Scatter/gather entry covering the whole region.
    pub(crate) fn sge(&self) -> ibv_sge {
        ibv_sge {
            addr: self.addr(),
            length: self.len() as u32,
            lkey: self.lkey(),
        }
    }
}

impl Drop for Mr {
    fn drop(&mut self) {
        // SAFETY: called once; deregistered before PD and buffer go away.
        unsafe { ibv_dereg_mr(self.mr.as_ptr()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buf_is_page_aligned_and_zeroed() {
        let buf = AlignedBuf::zeroed(64).unwrap();
        assert_eq!(buf.addr() % BUF_ALIGN as u64, 0);
        assert_eq!(buf.len(), 64);
        assert!(buf.snapshot().iter().all(|&b| b == 0));
        assert_eq!(buf.read_u64(), 0);
    }

    #[test]
    fn message_is_nul_padded_and_readable() {
        let mut buf = AlignedBuf::zeroed(64).unwrap();
        buf.write_message("hello #1");
        assert_eq!(buf.text(), "hello #1");
        assert_eq!(buf.snapshot()[8..], [0u8; 56]);

        // Shorter follow-up must not leave stale tail bytes behind.
        buf.write_message("hi");
        assert_eq!(buf.text(), "hi");
    }

    #[test]
    fn long_message_is_truncated_with_nul() {
        let mut buf = AlignedBuf::zeroed(16).unwrap();
        buf.write_message(&"x".repeat(100));
        let snap = buf.snapshot();
        assert_eq!(snap[15], 0);
        assert_eq!(buf.text().len(), 15);
    }

    #[test]
    fn descriptor_wire_form_is_12_le_bytes() {
        let d = MrDescriptor {
            rkey: 0x0102_0304,
            addr: 0x1122_3344_5566_7788,
        };
        let wire = d.to_wire();
        assert_eq!(wire.len(), MrDescriptor::WIRE_LEN);
        assert_eq!(&wire[..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&wire[4..], &[0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(MrDescriptor::from_wire(&wire), d);
    }

    #[test]
    fn permission_sets_compose() {
        let p = Permission::LOCAL_WRITE | Permission::REMOTE_ATOMIC;
        assert!(p.contains(Permission::LOCAL_WRITE));
        assert!(p.contains(Permission::REMOTE_ATOMIC));
        assert!(!p.contains(Permission::REMOTE_READ));
    }
}
