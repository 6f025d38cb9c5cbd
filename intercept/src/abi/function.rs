//! Typed function descriptors.
//!
//! `Function` is implemented for `extern "C"` and `extern "C-unwind"` function
//! pointers (and their `unsafe` variants) of up to twelve arguments, so the
//! signature a trampoline is emitted from is derived from the same type the
//! caller invokes it through.

use super::{ArgType, ReturnClass, Signature};

/// A type that can be passed by value under the C calling convention.
///
/// # Safety
/// `ARG` must describe how the platform C ABI passes `Self`.
pub unsafe trait AbiType {
    const ARG: ArgType;
}

/// A type that can be returned under the C calling convention.
///
/// # Safety
/// `RET` must describe how the platform C ABI returns `Self`.
pub unsafe trait AbiReturn {
    const RET: ReturnClass;
}

macro_rules! abi_integer {
    ($($t:ty),*) => {
        $(
            unsafe impl AbiType for $t {
                const ARG: ArgType = ArgType::integer(core::mem::size_of::<$t>());
            }
            unsafe impl AbiReturn for $t {
                const RET: ReturnClass = ReturnClass::Integer;
            }
        )*
    };
}

abi_integer!(u8, i8, u16, i16, u32, i32, u64, i64, usize, isize, bool);

unsafe impl AbiType for f32 {
    const ARG: ArgType = ArgType::float(4);
}
unsafe impl AbiType for f64 {
    const ARG: ArgType = ArgType::float(8);
}
unsafe impl AbiReturn for f32 {
    const RET: ReturnClass = ReturnClass::Float;
}
unsafe impl AbiReturn for f64 {
    const RET: ReturnClass = ReturnClass::Float;
}

unsafe impl<T> AbiType for *const T {
    const ARG: ArgType = ArgType::integer(core::mem::size_of::<usize>());
}
unsafe impl<T> AbiType for *mut T {
    const ARG: ArgType = ArgType::integer(core::mem::size_of::<usize>());
}
unsafe impl<T> AbiReturn for *const T {
    const RET: ReturnClass = ReturnClass::Integer;
}
unsafe impl<T> AbiReturn for *mut T {
    const RET: ReturnClass = ReturnClass::Integer;
}

unsafe impl AbiReturn for () {
    const RET: ReturnClass = ReturnClass::Void;
}

/// A function pointer a trampoline can stand in for.
///
/// # Safety
/// Implementors must be plain code pointers whose `signature` matches the
/// platform ABI of the pointee.
pub unsafe trait Function: Sized + Copy + Send + Sync + 'static {
    type Arguments;
    type Output;

    const ARITY: usize;

    fn signature() -> Signature;

    /// # Safety
    /// `ptr` must be executable code with this function's ABI.
    unsafe fn from_ptr(ptr: *const ()) -> Self;

    fn to_ptr(&self) -> *const ();

    /// # Safety
    /// Same contract as calling the underlying function pointer.
    unsafe fn invoke(&self, args: Self::Arguments) -> Self::Output;
}

macro_rules! count {
    () => { 0usize };
    ($head:ident $($tail:ident)*) => { 1usize + count!($($tail)*) };
}

macro_rules! impl_function {
    (@recurse () ($($nm:ident : $ty:ident),*)) => {
        impl_function!(@impl_all ($($nm : $ty),*));
    };
    (@recurse ($hd_nm:ident : $hd_ty:ident $(, $tl_nm:ident : $tl_ty:ident)*) ($($nm:ident : $ty:ident),*)) => {
        impl_function!(@impl_all ($($nm : $ty),*));
        impl_function!(@recurse ($($tl_nm : $tl_ty),*) ($($nm : $ty,)* $hd_nm : $hd_ty));
    };

    (@impl_all ($($nm:ident : $ty:ident),*)) => {
        impl_function!(@impl_abi ($($nm : $ty),*) "C");
        impl_function!(@impl_abi ($($nm : $ty),*) "C-unwind");
    };

    (@impl_abi ($($nm:ident : $ty:ident),*) $abi:tt) => {
        impl_function!(@impl_fn (extern $abi fn($($ty),*) -> Ret) ($($nm : $ty),*));
        impl_function!(@impl_fn (unsafe extern $abi fn($($ty),*) -> Ret) ($($nm : $ty),*));
    };

    (@impl_fn ($($fn_t:tt)*) ($($nm:ident : $ty:ident),*)) => {
        unsafe impl<Ret: AbiReturn + 'static, $($ty: AbiType + 'static),*> Function for $($fn_t)* {
            type Arguments = ($($ty,)*);
            type Output = Ret;

            const ARITY: usize = count!($($ty)*);

            fn signature() -> Signature {
                Signature::new(vec![$(<$ty as AbiType>::ARG),*], <Ret as AbiReturn>::RET)
            }

            #[inline]
            unsafe fn from_ptr(ptr: *const ()) -> Self {
                core::mem::transmute(ptr)
            }

            #[inline]
            fn to_ptr(&self) -> *const () {
                *self as *const ()
            }

            #[inline]
            #[allow(non_snake_case)]
            unsafe fn invoke(&self, ($($nm,)*): Self::Arguments) -> Ret {
                (*self)($($nm),*)
            }
        }
    };

    ($($nm:ident : $ty:ident),*) => {
        impl_function!(@recurse ($($nm : $ty),*) ());
    };
}

impl_function! {
    __arg_0:  A, __arg_1:  B, __arg_2:  C, __arg_3:  D, __arg_4:  E, __arg_5:  F,
    __arg_6:  G, __arg_7:  H, __arg_8:  I, __arg_9:  J, __arg_10: K, __arg_11: L
}
