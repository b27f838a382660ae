//! Explicit memory copies between host and device address spaces
//!
//! These are the user-driven transfer entry points: flat copies with per-end
//! byte offsets and N-dimensional rectangle copies that recurse down to
//! contiguous innermost rows. Every piece of offset and extent arithmetic is
//! checked; overflow is a recoverable error, never a wrap-around. Copies
//! between two distinct non-host devices are rejected (a host-bounced copy
//! is the caller's decision to make, not the engine's).

use offload_backends::DevicePtr;

use crate::error::{Error, Result};
use crate::registry::Registry;

/// One end of an explicit copy
#[derive(Debug, Clone, Copy)]
pub enum CopyEndpoint {
    /// Host memory at a raw address
    Host {
        /// Host address
        addr: u64,
    },
    /// Device memory at a raw device address
    Device {
        /// Registry device id
        device: i64,
        /// Raw device address
        addr: u64,
    },
}

impl CopyEndpoint {
    /// Host-side endpoint
    pub fn host(addr: u64) -> Self {
        CopyEndpoint::Host { addr }
    }

    /// Device-side endpoint
    pub fn device(device: i64, addr: u64) -> Self {
        CopyEndpoint::Device { device, addr }
    }

    fn offset(self, bytes: usize) -> Result<Self> {
        let advance = |addr: u64| addr.checked_add(bytes as u64).ok_or(Error::CopyOverflow);
        Ok(match self {
            CopyEndpoint::Host { addr } => CopyEndpoint::Host { addr: advance(addr)? },
            CopyEndpoint::Device { device, addr } => CopyEndpoint::Device {
                device,
                addr: advance(addr)?,
            },
        })
    }
}

/// Shape of an N-dimensional rectangle copy
///
/// All five slices must share one length, the number of dimensions. The
/// copied region spans `volume[d]` elements starting `offsets[d]` elements
/// into each dimension of an array of extent `dims[d]`, separately for each
/// end.
#[derive(Debug, Clone, Copy)]
pub struct RectCopy<'a> {
    /// Size of one element in bytes
    pub element_size: usize,
    /// Extent of the copied region, in elements per dimension
    pub volume: &'a [usize],
    /// Element offsets into the destination array
    pub dst_offsets: &'a [usize],
    /// Element offsets into the source array
    pub src_offsets: &'a [usize],
    /// Full extent of the destination array, in elements per dimension
    pub dst_dims: &'a [usize],
    /// Full extent of the source array, in elements per dimension
    pub src_dims: &'a [usize],
}

fn row_stride(dims: &[usize], level: usize) -> Result<usize> {
    dims[level + 1..]
        .iter()
        .try_fold(1usize, |acc, d| acc.checked_mul(*d))
        .ok_or(Error::CopyOverflow)
}

impl Registry {
    /// Copy `len` bytes from `src + src_offset` to `dst + dst_offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDevice`] for an unresolvable device endpoint,
    /// [`Error::CrossDeviceCopy`] when both ends name distinct devices, and
    /// [`Error::CopyOverflow`] on offset overflow.
    pub fn copy(
        &self,
        dst: CopyEndpoint,
        src: CopyEndpoint,
        len: usize,
        dst_offset: usize,
        src_offset: usize,
    ) -> Result<()> {
        let dst = dst.offset(dst_offset)?;
        let src = src.offset(src_offset)?;
        if len == 0 {
            return Ok(());
        }
        match (dst, src) {
            (CopyEndpoint::Host { addr: dst }, CopyEndpoint::Host { addr: src }) => {
                // Safety: the caller guarantees both host ranges are live for
                // `len` bytes; the ranges may overlap.
                unsafe {
                    std::ptr::copy(src as usize as *const u8, dst as usize as *mut u8, len);
                }
                Ok(())
            }
            (CopyEndpoint::Device { device, addr }, CopyEndpoint::Host { addr: src }) => {
                let target = self.resolve(device).ok_or(Error::InvalidDevice(device))?;
                target.copy_in(DevicePtr::new(addr), src, len)
            }
            (CopyEndpoint::Host { addr: dst }, CopyEndpoint::Device { device, addr }) => {
                let source = self.resolve(device).ok_or(Error::InvalidDevice(device))?;
                source.copy_out(dst, DevicePtr::new(addr), len)
            }
            (
                CopyEndpoint::Device { device: dst_dev, addr: dst },
                CopyEndpoint::Device { device: src_dev, addr: src },
            ) => {
                if dst_dev != src_dev {
                    return Err(Error::CrossDeviceCopy);
                }
                let target = self.resolve(dst_dev).ok_or(Error::InvalidDevice(dst_dev))?;
                target.copy_within(DevicePtr::new(dst), DevicePtr::new(src), len)
            }
        }
    }

    /// Copy an N-dimensional rectangle between two (possibly differently
    /// shaped) arrays.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RectShape`] when the shape slices disagree on
    /// dimensionality, plus everything [`copy`](Self::copy) can return.
    pub fn copy_rect(&self, dst: CopyEndpoint, src: CopyEndpoint, rect: &RectCopy<'_>) -> Result<()> {
        let dims = rect.volume.len();
        if dims == 0 {
            return Err(Error::RectShape("zero dimensions"));
        }
        if rect.dst_offsets.len() != dims
            || rect.src_offsets.len() != dims
            || rect.dst_dims.len() != dims
            || rect.src_dims.len() != dims
        {
            return Err(Error::RectShape("dimension count mismatch"));
        }
        self.rect_level(dst, src, rect, 0, 0, 0)
    }

    fn rect_level(
        &self,
        dst: CopyEndpoint,
        src: CopyEndpoint,
        rect: &RectCopy<'_>,
        level: usize,
        dst_base: usize,
        src_base: usize,
    ) -> Result<()> {
        let last = rect.volume.len() - 1;
        let elem = |n: usize| -> Result<usize> {
            n.checked_mul(rect.element_size).ok_or(Error::CopyOverflow)
        };

        if level == last {
            let dst_off = dst_base
                .checked_add(rect.dst_offsets[level])
                .ok_or(Error::CopyOverflow)?;
            let src_off = src_base
                .checked_add(rect.src_offsets[level])
                .ok_or(Error::CopyOverflow)?;
            let len = elem(rect.volume[level])?;
            return self.copy(dst, src, len, elem(dst_off)?, elem(src_off)?);
        }

        let dst_stride = row_stride(rect.dst_dims, level)?;
        let src_stride = row_stride(rect.src_dims, level)?;
        for i in 0..rect.volume[level] {
            let dst_next = rect.dst_offsets[level]
                .checked_add(i)
                .and_then(|row| row.checked_mul(dst_stride))
                .and_then(|off| off.checked_add(dst_base))
                .ok_or(Error::CopyOverflow)?;
            let src_next = rect.src_offsets[level]
                .checked_add(i)
                .and_then(|row| row.checked_mul(src_stride))
                .and_then(|off| off.checked_add(src_base))
                .ok_or(Error::CopyOverflow)?;
            self.rect_level(dst, src, rect, level + 1, dst_next, src_next)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offload_backends::CpuBackend;
    use std::sync::Arc;

    fn cpu_registry(devices: usize) -> Registry {
        Registry::with_backends(vec![Arc::new(CpuBackend::with_devices(devices))])
    }

    #[test]
    fn test_host_to_host_copy() {
        let registry = cpu_registry(1);
        let src = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut dst = [0u8; 8];
        registry
            .copy(
                CopyEndpoint::host(dst.as_mut_ptr() as u64),
                CopyEndpoint::host(src.as_ptr() as u64),
                4,
                2,
                1,
            )
            .unwrap();
        assert_eq!(dst, [0, 0, 2, 3, 4, 5, 0, 0]);
    }

    #[test]
    fn test_device_round_trip() {
        let registry = cpu_registry(1);
        let device = registry.resolve(0).unwrap();
        let buffer = device.alloc_buffer(8).unwrap();

        let value = 0x1122_3344_5566_7788u64;
        let mut back = 0u64;
        registry
            .copy(
                CopyEndpoint::device(0, buffer.base.addr()),
                CopyEndpoint::host(&value as *const u64 as u64),
                8,
                0,
                0,
            )
            .unwrap();
        registry
            .copy(
                CopyEndpoint::host(&mut back as *mut u64 as u64),
                CopyEndpoint::device(0, buffer.base.addr()),
                8,
                0,
                0,
            )
            .unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_cross_device_rejected() {
        let registry = cpu_registry(2);
        let result = registry.copy(
            CopyEndpoint::device(0, 0x1000),
            CopyEndpoint::device(1, 0x2000),
            8,
            0,
            0,
        );
        assert!(matches!(result, Err(Error::CrossDeviceCopy)));
    }

    #[test]
    fn test_invalid_device_endpoint() {
        let registry = cpu_registry(1);
        let result = registry.copy(
            CopyEndpoint::device(5, 0x1000),
            CopyEndpoint::host(0x2000),
            8,
            0,
            0,
        );
        assert!(matches!(result, Err(Error::InvalidDevice(5))));
    }

    #[test]
    fn test_rect_copy_submatrix() {
        let registry = cpu_registry(1);
        // 4x4 source, copy its central 2x2 into the top-left of a 2x2 dest.
        #[rustfmt::skip]
        let src: [u32; 16] = [
             0,  1,  2,  3,
             4,  5,  6,  7,
             8,  9, 10, 11,
            12, 13, 14, 15,
        ];
        let mut dst = [0u32; 4];
        let rect = RectCopy {
            element_size: 4,
            volume: &[2, 2],
            dst_offsets: &[0, 0],
            src_offsets: &[1, 1],
            dst_dims: &[2, 2],
            src_dims: &[4, 4],
        };
        registry
            .copy_rect(
                CopyEndpoint::host(dst.as_mut_ptr() as u64),
                CopyEndpoint::host(src.as_ptr() as u64),
                &rect,
            )
            .unwrap();
        assert_eq!(dst, [5, 6, 9, 10]);
    }

    #[test]
    fn test_rect_shape_mismatch() {
        let registry = cpu_registry(1);
        let rect = RectCopy {
            element_size: 1,
            volume: &[2, 2],
            dst_offsets: &[0],
            src_offsets: &[0, 0],
            dst_dims: &[2, 2],
            src_dims: &[2, 2],
        };
        let result = registry.copy_rect(CopyEndpoint::host(0), CopyEndpoint::host(0), &rect);
        assert!(matches!(result, Err(Error::RectShape(_))));
    }
}
