//! Wire helpers for halo rows and reduction scalars.
//!
//! Values travel in native byte order; a pool is assumed homogeneous.

use crate::sor_error::CommError;
use bytemuck::Pod;
use std::mem::size_of;

pub const SCALAR_BYTES: usize = size_of::<f64>();

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn expect_exact_len(actual: usize, expected: usize) -> Result<(), CommError> {
    if actual == expected {
        Ok(())
    } else {
        Err(CommError::LengthMismatch {
            expected,
            got: actual,
        })
    }
}

/// Byte length of a row of `ncol` cells.
pub fn row_bytes(ncol: usize) -> usize {
    ncol * size_of::<f64>()
}

/// Copy a received row into `dst`. Works for unaligned input.
pub fn read_row(data: &[u8], dst: &mut [f64]) -> Result<(), CommError> {
    expect_exact_len(data.len(), row_bytes(dst.len()))?;
    bytemuck::cast_slice_mut::<f64, u8>(dst).copy_from_slice(data);
    Ok(())
}

pub fn scalar(v: &f64) -> &[u8] {
    bytemuck::bytes_of(v)
}

pub fn read_scalar(data: &[u8]) -> Result<f64, CommError> {
    expect_exact_len(data.len(), SCALAR_BYTES)?;
    Ok(bytemuck::pod_read_unaligned(data))
}
