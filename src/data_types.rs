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

//! Element type tags for collective buffers
//!
//! Backends never see Rust types: every primitive call carries a [`Type`]
//! tag and a byte buffer, the same way a wire-level collective library
//! receives a datatype handle.

use bytemuck::Pod;

/// The element type tag handed to backend collectives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    /// Unsigned 8-bit integer
    UInt8,
    /// Signed 8-bit integer
    Int8,
    /// Unsigned 16-bit integer
    UInt16,
    /// Signed 16-bit integer
    Int16,
    /// Unsigned 32-bit integer
    UInt32,
    /// Signed 32-bit integer
    Int32,
    /// Unsigned 64-bit integer
    UInt64,
    /// Signed 64-bit integer
    Int64,
    /// 4-byte floating point value
    Float,
    /// 8-byte floating point value
    Double,
}

impl Type {
    /// Width of one element in bytes
    pub fn byte_width(&self) -> usize {
        match self {
            Type::UInt8 | Type::Int8 => 1,
            Type::UInt16 | Type::Int16 => 2,
            Type::UInt32 | Type::Int32 | Type::Float => 4,
            Type::UInt64 | Type::Int64 | Type::Double => 8,
        }
    }

    /// Whether bitwise reductions are defined for this type
    pub fn is_integer(&self) -> bool {
        !matches!(self, Type::Float | Type::Double)
    }

    /// Number of bytes occupied by `count` elements
    pub fn bytes_for(&self, count: usize) -> usize {
        count * self.byte_width()
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Type::UInt8 => "uint8",
            Type::Int8 => "int8",
            Type::UInt16 => "uint16",
            Type::Int16 => "int16",
            Type::UInt32 => "uint32",
            Type::Int32 => "int32",
            Type::UInt64 => "uint64",
            Type::Int64 => "int64",
            Type::Float => "float",
            Type::Double => "double",
        };
        f.write_str(name)
    }
}

/// A Rust type that can travel through a collective.
///
/// Implementations tie each plain-old-data type to the tag backends dispatch
/// on; the `Pod` bound lets buffers be reinterpreted as bytes without copies
/// of individual elements.
pub trait Element: Pod + Send + Sync + PartialEq + std::fmt::Debug + 'static {
    const TYPE: Type;
}

macro_rules! impl_element {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const TYPE: Type = Type::$tag;
            }
        )*
    };
}

impl_element! {
    u8 => UInt8,
    i8 => Int8,
    u16 => UInt16,
    i16 => Int16,
    u32 => UInt32,
    i32 => Int32,
    u64 => UInt64,
    i64 => Int64,
    f32 => Float,
    f64 => Double,
}
