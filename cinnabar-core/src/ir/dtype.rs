use std::fmt::Display;

/// Element type of a tensor value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataType {
    Bool,
    I32,
    I64,
    F16,
    BF16,
    F32,
    F64,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }

    /// Spelling of this type in emitted C-family source.
    pub fn c_name(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I32 => "int32_t",
            Self::I64 => "int64_t",
            Self::F16 => "__half",
            Self::BF16 => "__nv_bfloat16",
            Self::F32 => "float",
            Self::F64 => "double",
        }
    }

    /// Header the emitted source needs for this type, if any.
    pub fn c_dep(&self) -> Option<&'static str> {
        match self {
            Self::F16 => Some("#include \"cuda_fp16.h\""),
            Self::BF16 => Some("#include \"cuda_bf16.h\""),
            _ => None,
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        match self {
            Self::Bool => 1,
            Self::F16 | Self::BF16 => 2,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    /// Bytes per element at a kernel boundary, where floating-point tensors
    /// are stored as `f32` and everything else as `i64`.
    pub fn storage_bytes(&self) -> usize {
        if self.is_float() {
            4
        } else {
            8
        }
    }

    /// C spelling of the boundary storage type.
    pub fn storage_c_name(&self) -> &'static str {
        if self.is_float() {
            "float"
        } else {
            "int64_t"
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Self::F16 | Self::BF16 | Self::F32 | Self::F64)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "bool" => Self::Bool,
            "i32" => Self::I32,
            "i64" => Self::I64,
            "f16" => Self::F16,
            "bf16" => Self::BF16,
            "f32" => Self::F32,
            "f64" => Self::F64,
            _ => return None,
        })
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
