//! Host callables exposed to foreign code as function pointers.
//!
//! A [`Callback`] owns a libffi closure whose trampoline decodes the raw
//! arguments, runs the host callable and encodes its result. Failures never
//! unwind into foreign frames: host errors and panics are logged and a zeroed
//! result is returned instead.
//!
//! ```ignore
//! let cmp = lib.callback(
//!     CallbackDecl::new("cmp", |args| { /* ... */ })
//!         .param("a", AbiType::Pointer)
//!         .param("b", AbiType::Pointer)
//!         .returns(AbiType::I32),
//! )?;
//! lib.call(qsort, &[array.into(), 4u64.into(), 4u64.into(), cmp.as_value()])?;
//! ```

use std::cell::RefCell;
use std::ffi::c_void;
use std::fmt;
use std::mem::ManuallyDrop;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;

use bumpalo::Bump;
use libffi::low::ffi_cif;
use libffi::middle::{Cif, Closure};
use tracing::error;

use dynbind_core::{
    AbiType, AbiValue, AlignedBuf, BindError, CallError, Keepalive, MarshalType, ResolvedOptions,
    ResolvedType, TypeMarker, Value,
};

use crate::declaration::{CallbackDecl, CallbackFn};
use crate::errno::CaptureGuard;
use crate::function::check_by_value;
use crate::resolver::Resolver;

/// How one callback parameter or result converts.
#[derive(Debug, Clone)]
enum Slot {
    Raw(AbiType),
    Cast(MarshalType),
}

impl Slot {
    fn abi_type(&self) -> AbiType {
        match self {
            Slot::Raw(abi) => abi.clone(),
            Slot::Cast(cast) => cast.abi_type(),
        }
    }

    fn decode(&self, raw: AbiValue) -> Result<Value, CallError> {
        match self {
            Slot::Raw(abi) => Ok(abi.decode(raw)),
            Slot::Cast(cast) => Ok(cast.from_abi(raw)?),
        }
    }

    fn encode(&self, value: &Value) -> Result<(AbiValue, Option<Keepalive>), CallError> {
        let encoded = match self {
            Slot::Raw(AbiType::Void) => (AbiValue::Void, None),
            Slot::Raw(AbiType::Pointer) => MarshalType::Handle.to_abi_owned(value)?,
            // Non-pointer raw types never borrow the arena.
            Slot::Raw(abi) => (abi.encode(value, &Bump::new())?, None),
            Slot::Cast(cast) => cast.to_abi_owned(value)?,
        };
        Ok(encoded)
    }
}

struct CallbackState {
    name: String,
    params: Vec<Slot>,
    result: Slot,
    result_abi: AbiType,
    use_errno: bool,
    handler: CallbackFn,
    /// Storage behind the most recent pointer result.
    last: RefCell<Option<Keepalive>>,
}

impl CallbackState {
    /// # Safety
    ///
    /// `args` must hold one valid argument pointer per parameter.
    unsafe fn dispatch(&self, args: *const *const c_void) -> Result<AbiValue, CallError> {
        let mut values = Vec::with_capacity(self.params.len());
        for (index, slot) in self.params.iter().enumerate() {
            // SAFETY: libffi passes one pointer per declared parameter, each
            // valid for the parameter's size.
            let raw = unsafe {
                let arg = *args.add(index);
                slot.abi_type().read_at(arg.cast::<u8>())
            };
            values.push(slot.decode(raw)?);
        }

        let value = (self.handler)(&values)?;
        let (raw, keep) = self.result.encode(&value)?;
        *self.last.borrow_mut() = keep;
        Ok(raw)
    }

    fn zeroed_result(&self) -> AbiValue {
        let buf = AlignedBuf::zeroed(self.result_abi.size());
        // SAFETY: `buf` covers the result type.
        unsafe { self.result_abi.read_at(buf.as_ptr()) }
    }
}

unsafe extern "C" fn trampoline(
    _cif: &ffi_cif,
    result: &mut u8,
    args: *const *const c_void,
    state: &CallbackState,
) {
    let _errno = state.use_errno.then(CaptureGuard::enter);

    // SAFETY: libffi calls the trampoline with arguments matching the cif.
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| unsafe { state.dispatch(args) }));
    let raw = match outcome {
        Ok(Ok(raw)) => raw,
        Ok(Err(err)) => {
            error!(callback = %state.name, error = %err, "callback failed; returning zero");
            state.zeroed_result()
        }
        Err(_) => {
            error!(callback = %state.name, "callback panicked; returning zero");
            state.zeroed_result()
        }
    };

    // SAFETY: libffi's return slot is at least one word and fits the result type.
    unsafe { raw.write_return(result as *mut u8) };
}

/// A host callable bound to a foreign-callable function pointer.
///
/// The pointer stays valid as long as the `Callback` lives.
pub struct Callback {
    // Dropped before `state`, which it borrows.
    closure: ManuallyDrop<Closure<'static>>,
    state: NonNull<CallbackState>,
}

impl Callback {
    pub(crate) fn new(
        decl: CallbackDecl,
        resolver: &Resolver<'_>,
        options: &ResolvedOptions,
    ) -> Result<Self, BindError> {
        let CallbackDecl {
            name,
            params,
            returns,
            use_errno,
            handler,
            ..
        } = decl;

        let resolve = |parameter: &str, marker: &TypeMarker| {
            resolver
                .resolve(marker, options)
                .map_err(|unresolved| BindError::TypehintUnresolved {
                    function: name.clone(),
                    parameter: parameter.to_string(),
                    unresolved,
                })
        };

        let result = resolve("return", &returns)?;
        let params = params
            .iter()
            .map(|(param, marker)| resolve(param, marker))
            .collect::<Result<Vec<_>, _>>()?;

        let unsupported = |reason: String| BindError::UnsupportedType {
            function: name.clone(),
            foreign_name: "callback".to_string(),
            arguments: params.iter().map(ToString::to_string).collect(),
            result: result.to_string(),
            reason,
        };

        let mut slots = Vec::with_capacity(params.len());
        for param in &params {
            let slot = match param {
                ResolvedType::Raw(AbiType::Void) => {
                    return Err(unsupported("void is not a parameter type".to_string()));
                }
                ResolvedType::Raw(abi) => Slot::Raw(abi.clone()),
                ResolvedType::Cast(cast) => Slot::Cast(cast.clone()),
                ResolvedType::Infer => {
                    return Err(unsupported(
                        "callback parameters need a concrete type".to_string(),
                    ));
                }
                ResolvedType::Host(host) => {
                    return Err(unsupported(format!(
                        "host type '{host}' has no ABI representation"
                    )));
                }
            };
            check_by_value(&slot.abi_type()).map_err(unsupported)?;
            slots.push(slot);
        }

        let result_slot = match &result {
            ResolvedType::Infer => Slot::Raw(AbiType::Void),
            ResolvedType::Raw(abi) => Slot::Raw(abi.clone()),
            ResolvedType::Cast(cast) => Slot::Cast(cast.clone()),
            ResolvedType::Host(host) => {
                return Err(unsupported(format!(
                    "host type '{host}' has no ABI representation"
                )));
            }
        };
        let result_abi = result_slot.abi_type();
        check_by_value(&result_abi).map_err(unsupported)?;

        let cif = Cif::new(
            slots.iter().map(|s| s.abi_type().ffi_type()),
            result_abi.ffi_type(),
        );

        let state = NonNull::from(Box::leak(Box::new(CallbackState {
            name: name.clone(),
            params: slots,
            result: result_slot,
            result_abi,
            use_errno,
            handler,
            last: RefCell::new(None),
        })));

        // SAFETY: `state` is freed only in `Drop`, after the closure.
        let userdata: &'static CallbackState = unsafe { state.as_ref() };
        let closure = Closure::new(cif, trampoline, userdata);

        Ok(Self {
            closure: ManuallyDrop::new(closure),
            state,
        })
    }

    pub fn name(&self) -> &str {
        // SAFETY: `state` lives as long as `self`.
        unsafe { &self.state.as_ref().name }
    }

    /// Address of the foreign-callable entry point.
    pub fn code_ptr(&self) -> usize {
        *self.closure.code_ptr() as usize
    }

    /// The entry point as a pointer argument.
    pub fn as_value(&self) -> Value {
        Value::Pointer(self.code_ptr())
    }
}

impl Drop for Callback {
    fn drop(&mut self) {
        // SAFETY: the closure is dropped exactly once, before the state it
        // borrows; `state` came from `Box::leak` and is not used afterwards.
        unsafe {
            ManuallyDrop::drop(&mut self.closure);
            drop(Box::from_raw(self.state.as_ptr()));
        }
    }
}

impl From<&Callback> for Value {
    fn from(callback: &Callback) -> Self {
        callback.as_value()
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SAFETY: `state` lives as long as `self`.
        let state = unsafe { self.state.as_ref() };
        f.debug_struct("Callback")
            .field("name", &state.name)
            .field("params", &state.params)
            .field("result", &state.result)
            .field("code_ptr", &format_args!("{:#x}", self.code_ptr()))
            .finish()
    }
}
