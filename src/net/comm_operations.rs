// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Communication operation types and reduction kernels

use std::fmt;

use bytemuck::Pod;

use crate::data_types::Type;
use crate::error::{NbcError, NbcResult};

/// Reduction operations for collective communication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
    Prod,
    Land,
    Lor,
    Band,
    Bor,
}

impl fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Min => "min",
            ReduceOp::Max => "max",
            ReduceOp::Prod => "prod",
            ReduceOp::Land => "land",
            ReduceOp::Lor => "lor",
            ReduceOp::Band => "band",
            ReduceOp::Bor => "bor",
        };
        write!(f, "{}", name)
    }
}

impl ReduceOp {
    /// Whether `op` is defined for elements of `data_type`
    pub fn supports(&self, data_type: Type) -> bool {
        match self {
            ReduceOp::Band | ReduceOp::Bor => data_type.is_integer(),
            _ => true,
        }
    }
}

fn combine<T: Pod>(acc: &mut [u8], src: &[u8], f: impl Fn(T, T) -> T) {
    let width = std::mem::size_of::<T>();
    for (a, s) in acc.chunks_exact_mut(width).zip(src.chunks_exact(width)) {
        let x: T = bytemuck::pod_read_unaligned(a);
        let y: T = bytemuck::pod_read_unaligned(s);
        a.copy_from_slice(bytemuck::bytes_of(&f(x, y)));
    }
}

macro_rules! reduce_int {
    ($t:ty, $op:expr, $acc:expr, $src:expr) => {
        match $op {
            ReduceOp::Sum => combine::<$t>($acc, $src, |a, b| a.wrapping_add(b)),
            ReduceOp::Prod => combine::<$t>($acc, $src, |a, b| a.wrapping_mul(b)),
            ReduceOp::Min => combine::<$t>($acc, $src, |a, b| a.min(b)),
            ReduceOp::Max => combine::<$t>($acc, $src, |a, b| a.max(b)),
            ReduceOp::Land => combine::<$t>($acc, $src, |a, b| (a != 0 && b != 0) as $t),
            ReduceOp::Lor => combine::<$t>($acc, $src, |a, b| (a != 0 || b != 0) as $t),
            ReduceOp::Band => combine::<$t>($acc, $src, |a, b| a & b),
            ReduceOp::Bor => combine::<$t>($acc, $src, |a, b| a | b),
        }
    };
}

macro_rules! reduce_float {
    ($t:ty, $op:expr, $acc:expr, $src:expr) => {
        match $op {
            ReduceOp::Sum => combine::<$t>($acc, $src, |a, b| a + b),
            ReduceOp::Prod => combine::<$t>($acc, $src, |a, b| a * b),
            ReduceOp::Min => combine::<$t>($acc, $src, |a, b| a.min(b)),
            ReduceOp::Max => combine::<$t>($acc, $src, |a, b| a.max(b)),
            ReduceOp::Land => combine::<$t>($acc, $src, |a, b| {
                if a != 0.0 && b != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }),
            ReduceOp::Lor => combine::<$t>($acc, $src, |a, b| {
                if a != 0.0 || b != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }),
            ReduceOp::Band | ReduceOp::Bor => {
                return Err(NbcError::TypeError(format!(
                    "bitwise reduction {} on floating point data",
                    $op
                )))
            }
        }
    };
}

/// Element-wise `acc = op(acc, src)` over byte buffers holding `data_type`
/// elements.
pub fn reduce_into(data_type: Type, op: ReduceOp, acc: &mut [u8], src: &[u8]) -> NbcResult<()> {
    if !op.supports(data_type) {
        return Err(NbcError::TypeError(format!(
            "reduction {} is not defined for {}",
            op, data_type
        )));
    }
    if acc.len() != src.len() || acc.len() % data_type.byte_width() != 0 {
        return Err(NbcError::Invalid(format!(
            "cannot reduce {} bytes into {} bytes of {}",
            src.len(),
            acc.len(),
            data_type
        )));
    }
    match data_type {
        Type::UInt8 => reduce_int!(u8, op, acc, src),
        Type::Int8 => reduce_int!(i8, op, acc, src),
        Type::UInt16 => reduce_int!(u16, op, acc, src),
        Type::Int16 => reduce_int!(i16, op, acc, src),
        Type::UInt32 => reduce_int!(u32, op, acc, src),
        Type::Int32 => reduce_int!(i32, op, acc, src),
        Type::UInt64 => reduce_int!(u64, op, acc, src),
        Type::Int64 => reduce_int!(i64, op, acc, src),
        Type::Float => reduce_float!(f32, op, acc, src),
        Type::Double => reduce_float!(f64, op, acc, src),
    }
    Ok(())
}
