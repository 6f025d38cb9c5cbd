//! Calling-convention descriptors and argument placement.
//!
//! A trampoline only needs to know how many bytes of the caller's outgoing
//! argument area it has to re-materialize below its own frame, and whether the
//! call returns through a hidden result pointer. Both follow from classifying
//! each argument against the target convention.

pub mod function;

pub use function::{AbiReturn, AbiType, Function};

use crate::error::{DetourError, Result};

/// Upper bound on the stack argument area a framed stub will copy.
pub const MAX_STACK_ARG_BYTES: usize = 512;

/// Composites up to this size are classified field-by-field by both
/// conventions, which this crate does not model.
const MAX_REGISTER_AGGREGATE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallingConvention {
    /// System V AMD64.
    SysV64,
    /// AArch64 procedure call standard. `darwin` selects Apple's packing of
    /// stack arguments by natural size.
    Aapcs64 { darwin: bool },
}

impl CallingConvention {
    #[cfg(target_arch = "x86_64")]
    pub const fn host() -> Self {
        CallingConvention::SysV64
    }

    #[cfg(target_arch = "aarch64")]
    pub const fn host() -> Self {
        CallingConvention::Aapcs64 {
            darwin: cfg!(target_vendor = "apple"),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            CallingConvention::SysV64 => "sysv64",
            CallingConvention::Aapcs64 { darwin: false } => "aapcs64",
            CallingConvention::Aapcs64 { darwin: true } => "aapcs64-darwin",
        }
    }

    pub const fn int_arg_regs(self) -> usize {
        match self {
            CallingConvention::SysV64 => 6,
            CallingConvention::Aapcs64 { .. } => 8,
        }
    }

    pub const fn float_arg_regs(self) -> usize {
        8
    }

    pub const fn stack_alignment(self) -> usize {
        16
    }

    /// Bytes below the stack pointer a leaf may use without adjusting it.
    pub const fn red_zone(self) -> usize {
        match self {
            CallingConvention::SysV64 => 128,
            CallingConvention::Aapcs64 { .. } => 0,
        }
    }

    /// Whether a hidden result pointer occupies the first integer argument
    /// register (RDI on SysV) instead of a dedicated one (X8 on AArch64).
    pub const fn indirect_result_uses_arg_reg(self) -> bool {
        matches!(self, CallingConvention::SysV64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgClass {
    Integer,
    Float,
    Aggregate,
}

/// One argument as the convention sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgType {
    pub class: ArgClass,
    pub size: usize,
    pub align: usize,
}

impl ArgType {
    pub const fn integer(size: usize) -> Self {
        Self { class: ArgClass::Integer, size, align: size }
    }

    pub const fn float(size: usize) -> Self {
        Self { class: ArgClass::Float, size, align: size }
    }

    pub const fn aggregate(size: usize, align: usize) -> Self {
        Self { class: ArgClass::Aggregate, size, align }
    }

    /// Describe a `#[repr(C)]` type passed by value.
    pub const fn aggregate_of<T>() -> Self {
        Self::aggregate(core::mem::size_of::<T>(), core::mem::align_of::<T>())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnClass {
    Void,
    Integer,
    Float,
    /// Returned through a caller-provided buffer.
    Indirect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub convention: CallingConvention,
    pub args: Vec<ArgType>,
    pub ret: ReturnClass,
}

impl Signature {
    /// A signature for the host convention.
    pub fn new(args: Vec<ArgType>, ret: ReturnClass) -> Self {
        Self::with_convention(CallingConvention::host(), args, ret)
    }

    pub fn with_convention(convention: CallingConvention, args: Vec<ArgType>, ret: ReturnClass) -> Self {
        Self { convention, args, ret }
    }
}

/// Where a signature's arguments land under its convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallLayout {
    pub convention: CallingConvention,
    pub int_regs: usize,
    pub float_regs: usize,
    /// Exact size of the caller's outgoing stack argument area.
    pub stack_bytes: usize,
    pub indirect_return: bool,
}

impl CallLayout {
    /// Number of 8-byte slots a stub copies to cover the stack area.
    pub fn stack_slots(&self) -> usize {
        align_up(self.stack_bytes, 8) / 8
    }
}

#[inline]
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn check_scalar(arg: &ArgType, index: usize) -> Result<()> {
    let valid = match arg.class {
        ArgClass::Integer => matches!(arg.size, 1 | 2 | 4 | 8),
        ArgClass::Float => matches!(arg.size, 4 | 8),
        ArgClass::Aggregate => true,
    };
    if !valid {
        return Err(DetourError::UnsupportedSignature(format!(
            "argument {index}: {:?} of {} bytes",
            arg.class, arg.size
        )));
    }
    Ok(())
}

fn check_aggregate(arg: &ArgType, index: usize) -> Result<()> {
    if arg.size <= MAX_REGISTER_AGGREGATE {
        return Err(DetourError::UnsupportedSignature(format!(
            "argument {index}: aggregate of {} bytes needs per-field classification",
            arg.size
        )));
    }
    if arg.align == 0 || !arg.align.is_power_of_two() {
        return Err(DetourError::UnsupportedSignature(format!(
            "argument {index}: alignment {} is not a power of two",
            arg.align
        )));
    }
    Ok(())
}

/// Compute where every argument of `sig` is placed.
pub fn layout(sig: &Signature) -> Result<CallLayout> {
    let conv = sig.convention;
    let mut int_used = 0usize;
    let mut float_used = 0usize;
    let mut stack = 0usize;

    let indirect_return = sig.ret == ReturnClass::Indirect;
    if indirect_return && conv.indirect_result_uses_arg_reg() {
        int_used += 1;
    }

    for (index, arg) in sig.args.iter().enumerate() {
        check_scalar(arg, index)?;
        if arg.class == ArgClass::Aggregate {
            check_aggregate(arg, index)?;
        }

        match conv {
            CallingConvention::SysV64 => match arg.class {
                ArgClass::Integer if int_used < conv.int_arg_regs() => int_used += 1,
                ArgClass::Float if float_used < conv.float_arg_regs() => float_used += 1,
                ArgClass::Integer | ArgClass::Float => stack += 8,
                // MEMORY class: copied into the argument area, eightbyte aligned.
                ArgClass::Aggregate => {
                    stack = align_up(stack, arg.align.max(8));
                    stack += align_up(arg.size, 8);
                }
            },
            CallingConvention::Aapcs64 { darwin } => {
                // Large composites travel as a pointer to a caller-made copy.
                let (class, size) = match arg.class {
                    ArgClass::Aggregate => (ArgClass::Integer, 8),
                    other => (other, arg.size),
                };
                let in_reg = match class {
                    ArgClass::Float => {
                        let fits = float_used < conv.float_arg_regs();
                        float_used += fits as usize;
                        fits
                    }
                    _ => {
                        let fits = int_used < conv.int_arg_regs();
                        int_used += fits as usize;
                        fits
                    }
                };
                if !in_reg {
                    if darwin {
                        stack = align_up(stack, size);
                        stack += size;
                    } else {
                        stack = align_up(stack, 8);
                        stack += 8;
                    }
                }
            }
        }
    }

    if stack > MAX_STACK_ARG_BYTES {
        return Err(DetourError::TooManyStackArgs { bytes: stack, max: MAX_STACK_ARG_BYTES });
    }

    Ok(CallLayout {
        convention: conv,
        int_regs: int_used.min(conv.int_arg_regs()),
        float_regs: float_used.min(conv.float_arg_regs()),
        stack_bytes: stack,
        indirect_return,
    })
}
