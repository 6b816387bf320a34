//! Integration tests calling into the system C library.
//!
//! These run against glibc's `libc.so.6` and `libm.so.6`.

#![cfg(all(target_os = "linux", target_env = "gnu"))]

use dynbind::prelude::*;
use dynbind::{DeclFlags, captured_errno};
use tracing_subscriber::EnvFilter;

const LIBC: &str = "libc.so.6";
const LIBM: &str = "libm.so.6";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn libc() -> Library {
    init_tracing();
    Library::new(LIBC, ScopeOptions::new()).expect("libc should load")
}

fn int32() -> ScopeOptions {
    ScopeOptions::new().with_int_width(IntWidth::W32)
}

// =============================================================================
// Loading
// =============================================================================

#[test]
fn test_load_records_path() {
    let lib = libc();
    assert!(lib.is_loaded());
    assert_eq!(lib.path(), Some(LIBC));
}

#[test]
fn test_missing_symbol() {
    let mut lib = libc();
    let err = lib
        .declare_function(FunctionDecl::new("dynbind_does_not_exist"))
        .unwrap_err();
    assert!(matches!(
        err,
        BindError::SymbolNotFound { ref symbol, .. } if symbol == "dynbind_does_not_exist"
    ));
}

// =============================================================================
// Scalars and references
// =============================================================================

#[test]
fn test_frexp_writes_integer_box() -> Result<(), DynbindError> {
    init_tracing();
    let mut lib = Library::new(LIBM, ScopeOptions::new())?;
    let frexp = lib.declare_function(
        FunctionDecl::new("frexp")
            .param("x", AbiType::F64)
            .param("exp", MarshalType::Reference)
            .returns(AbiType::F64),
    )?;
    lib.bind()?;

    let exp = Reference::integer(0);
    let mantissa = lib.call(frexp, &[Value::Float(4294967296.0), exp.clone().into()])?;
    assert_eq!(mantissa, Value::Float(0.5));

    assert_eq!(exp.as_int()?, 33);
    assert_eq!(exp.as_float()?, 33.0);
    assert_eq!(exp.to_string(), "33");
    assert!(exp.is_truthy());
    assert!(exp < 34);
    assert!(exp <= 33);
    assert!(exp == 33);
    assert!(exp != 32);
    assert!(exp >= 33);
    assert!(exp > 32);
    Ok(())
}

#[test]
fn test_fabsf_single_precision() -> Result<(), DynbindError> {
    init_tracing();
    let mut lib = Library::new(LIBM, ScopeOptions::new())?;
    let fabsf = lib.declare_function(
        FunctionDecl::new("fabsf")
            .param("x", TypeMarker::Float)
            .returns(TypeMarker::Float),
    )?;
    lib.bind()?;

    assert_eq!(lib.call(fabsf, &[Value::Float(-2.5)])?, Value::Float(2.5));
    Ok(())
}

#[test]
fn test_untyped_declaration_infers_arguments() -> Result<(), DynbindError> {
    let mut lib = libc();
    let abs = lib.declare_function(FunctionDecl::new("abs"))?;
    lib.bind()?;

    let function = lib.function(abs).expect("declared");
    assert!(function.signature().expect("bound").is_untyped());
    assert_eq!(lib.call(abs, &[Value::Int(-12)])?, Value::Int(12));
    Ok(())
}

#[test]
fn test_argument_count_is_checked() -> Result<(), DynbindError> {
    let mut lib = libc();
    let abs = lib.declare_function(
        FunctionDecl::new("abs")
            .param("n", TypeMarker::Int)
            .returns(TypeMarker::Int)
            .options(int32()),
    )?;

    assert!(matches!(
        lib.call(abs, &[Value::Int(1)]),
        Err(CallError::NotBound(_))
    ));
    lib.bind()?;
    assert!(matches!(
        lib.call(abs, &[]),
        Err(CallError::ArgumentCount { expected: 1, actual: 0, .. })
    ));
    Ok(())
}

// =============================================================================
// Strings
// =============================================================================

#[test]
fn test_strstr_non_ascii() -> Result<(), DynbindError> {
    let mut lib = libc();
    let strstr = lib.declare_function(
        FunctionDecl::new("strstr")
            .param("haystack", TypeMarker::Str)
            .param("needle", TypeMarker::Str)
            .returns(TypeMarker::Str),
    )?;
    lib.bind()?;

    let found = lib.call(strstr, &["Привет, мир".into(), "мир".into()])?;
    assert_eq!(found, Value::from("мир"));

    let missing = lib.call(strstr, &["abc".into(), "z".into()])?;
    assert!(missing.is_null());
    Ok(())
}

#[test]
fn test_wcschr_wide_strings() -> Result<(), DynbindError> {
    let mut lib = libc();
    let wcschr = lib.with_scope(ScopeOptions::new().with_wide_strings(), |lib| {
        lib.declare_function(
            FunctionDecl::new("wcschr")
                .param("s", TypeMarker::Str)
                .param("c", AbiType::I32)
                .returns(TypeMarker::Str),
        )
    })?;
    lib.bind()?;

    let tail = lib.call(wcschr, &["schöne Grüße".into(), Value::Int('G' as i64)])?;
    assert_eq!(tail, Value::from("Grüße"));
    Ok(())
}

#[test]
fn test_interior_nul_is_an_argument_error() -> Result<(), DynbindError> {
    let mut lib = libc();
    let strlen = lib.declare_function(
        FunctionDecl::new("strlen")
            .param("s", TypeMarker::Str)
            .returns(AbiType::U64),
    )?;
    lib.bind()?;

    assert_eq!(lib.call(strlen, &["héllo".into()])?, Value::UInt(6));
    let err = lib.call(strlen, &["a\0b".into()]).unwrap_err();
    assert!(matches!(
        err,
        CallError::Argument {
            index: 0,
            source: ConversionError::InteriorNul { position: 1 },
            ..
        }
    ));
    Ok(())
}

// =============================================================================
// Structures
// =============================================================================

#[test]
fn test_div_returns_structure_by_value() -> Result<(), DynbindError> {
    let mut lib = libc();
    let div = lib.with_scope(int32(), |lib| -> Result<FunctionId, BindError> {
        lib.declare_structure(
            StructDecl::new("div_t")
                .field("quot", TypeMarker::Int)
                .field("rem", TypeMarker::Int),
        )?;
        lib.declare_function(
            FunctionDecl::new("div")
                .param("numer", TypeMarker::Int)
                .param("denom", TypeMarker::Int)
                .returns(TypeMarker::named("div_t")),
        )
    })?;
    lib.bind()?;

    let result = lib.call(div, &[Value::Int(17), Value::Int(5)])?;
    let result = result.as_struct().expect("structure result");
    assert_eq!(result.get("quot")?, Value::Int(3));
    assert_eq!(result.get("rem")?, Value::Int(2));
    Ok(())
}

#[test]
fn test_gmtime_r_fills_structure() -> Result<(), DynbindError> {
    let mut lib = libc();
    let tm = lib.with_scope(int32(), |lib| {
        lib.declare_structure(
            StructDecl::new("tm")
                .field("tm_sec", TypeMarker::Int)
                .field("tm_min", TypeMarker::Int)
                .field("tm_hour", TypeMarker::Int)
                .field("tm_mday", TypeMarker::Int)
                .field("tm_mon", TypeMarker::Int)
                .field("tm_year", TypeMarker::Int)
                .field("tm_wday", TypeMarker::Int)
                .field("tm_yday", TypeMarker::Int)
                .field("tm_isdst", TypeMarker::Int)
                .field("tm_gmtoff", AbiType::I64)
                .field("tm_zone", TypeMarker::Str),
        )
    })?;
    let gmtime_r = lib.declare_function(
        FunctionDecl::new("gmtime_r")
            .param("timep", MarshalType::Reference)
            .param(
                "result",
                MarshalType::StructPointer {
                    name: "tm".to_string(),
                },
            )
            .returns(MarshalType::Handle),
    )?;
    lib.bind()?;

    let timep = Reference::new(AbiType::I64, &Value::Int(86_400 * 365))?;
    let out = Structure::new(tm);
    let ret = lib.call(gmtime_r, &[timep.into(), out.clone().into()])?;

    assert_eq!(ret, Value::Pointer(out.as_mut_ptr() as usize));
    assert_eq!(out.get("tm_year")?, Value::Int(71));
    assert_eq!(out.get("tm_mon")?, Value::Int(0));
    assert_eq!(out.get("tm_mday")?, Value::Int(1));
    assert_eq!(out.get("tm_gmtoff")?, Value::Int(0));
    assert_eq!(out.get("tm_zone")?, Value::from("GMT"));
    Ok(())
}

// =============================================================================
// Callbacks
// =============================================================================

#[test]
fn test_qsort_with_callback() -> Result<(), DynbindError> {
    let mut lib = libc();
    let qsort = lib.declare_function(
        FunctionDecl::new("qsort")
            .param("base", MarshalType::Reference)
            .param("nmemb", AbiType::U64)
            .param("size", AbiType::U64)
            .param("compar", MarshalType::Callback)
            .returns(TypeMarker::Void),
    )?;
    lib.bind()?;

    let compare = lib.callback(
        CallbackDecl::new("compare", |args| {
            let read = |v: &Value| -> i32 {
                let address = v.as_pointer().unwrap_or(0);
                // SAFETY: qsort passes pointers to elements of the array.
                unsafe { *(address as *const i32) }
            };
            Ok(Value::Int(i64::from(read(&args[0]).cmp(&read(&args[1])) as i32)))
        })
        .param("a", AbiType::Pointer)
        .param("b", AbiType::Pointer)
        .returns(AbiType::I32),
    )?;

    let values: Vec<Value> = [5, 1, 4, 2, 3].into_iter().map(Value::from).collect();
    let array = Reference::array_from(AbiType::I32, &values)?;
    lib.call(
        qsort,
        &[
            array.clone().into(),
            Value::from(5u64),
            Value::from(4u64),
            compare.as_value(),
        ],
    )?;

    let sorted: Vec<i64> = array.to_vec().iter().filter_map(Value::as_int).collect();
    assert_eq!(sorted, [1, 2, 3, 4, 5]);
    Ok(())
}

#[test]
fn test_callback_errno_capture() -> Result<(), DynbindError> {
    let lib = libc();
    let seen = std::rc::Rc::new(std::cell::Cell::new(None));
    let observed = seen.clone();
    let hook = lib.callback(
        CallbackDecl::new("hook", move |_| {
            observed.set(captured_errno());
            Ok(Value::Void)
        })
        .use_errno(),
    )?;

    dynbind::set_last_error(2);
    // SAFETY: the callback was declared as `void (*)(void)`.
    let f: unsafe extern "C" fn() = unsafe { std::mem::transmute(hook.code_ptr()) };
    unsafe { f() };

    assert_eq!(seen.get(), Some(2));
    assert_eq!(last_error().num, 2);
    Ok(())
}

// =============================================================================
// Errors
// =============================================================================

#[test]
fn test_chdir_reports_enoent() -> Result<(), DynbindError> {
    let mut lib = libc();
    let chdir = lib.declare_function(
        FunctionDecl::new("chdir")
            .param("path", TypeMarker::Str)
            .returns(TypeMarker::Int)
            .options(int32()),
    )?;
    lib.bind()?;

    let rc = lib.call(chdir, &["/dynbind/does/not/exist".into()])?;
    assert_eq!(rc, Value::Int(-1));

    let error = last_error();
    assert_eq!(error.code, "ENOENT");
    assert!(error.message.contains("No such file"));
    Ok(())
}

#[test]
fn test_redeclaration() -> Result<(), DynbindError> {
    let mut lib = libc();
    lib.declare_function(FunctionDecl::new("abs"))?;
    let err = lib.declare_function(FunctionDecl::new("abs")).unwrap_err();
    assert!(matches!(err, BindError::FunctionRedeclared(ref name) if name == "abs"));
    Ok(())
}

#[test]
fn test_unresolved_typehint_degrades() -> Result<(), DynbindError> {
    let mut lib = libc();
    let buggy1 = lib.declare_function(
        FunctionDecl::new("buggy1")
            .foreign_name("abs")
            .param("x", TypeMarker::named("SomeDummyType")),
    )?;

    let err = lib.bind().unwrap_err();
    assert!(matches!(err, BindError::TypehintUnresolved { .. }));
    assert!(err.to_string().contains("SomeDummyType"));

    // Cleared typehints bind untyped on the next pass.
    lib.bind()?;
    let function = lib.function(buggy1).expect("declared");
    assert!(function.flags().contains(DeclFlags::DEGRADED));
    assert_eq!(lib.call(buggy1, &[Value::Int(-9)])?, Value::Int(9));
    Ok(())
}

#[test]
fn test_unsupported_type_names_function() -> Result<(), DynbindError> {
    let mut lib = libc();
    lib.declare_function(
        FunctionDecl::new("buggy2")
            .foreign_name("labs")
            .param("x", TypeMarker::host("Widget")),
    )?;

    let err = lib.bind().unwrap_err();
    assert!(matches!(err, BindError::UnsupportedType { .. }));
    assert!(err.to_string().contains("buggy2 (labs)"));

    // Unsupported types are raised again on every pass.
    assert!(lib.bind().is_err());
    Ok(())
}

// =============================================================================
// Wrapped declarations
// =============================================================================

#[test]
fn test_method_receiver_from_owner() -> Result<(), DynbindError> {
    let mut lib = libc();
    lib.register_type("Number", TypeMarker::Int)?;
    let absolute = lib.declare_function(
        FunctionDecl::method("absolute", "Number")
            .foreign_name("abs")
            .returns(TypeMarker::Int)
            .options(int32()),
    )?;
    lib.bind()?;

    let function = lib.function(absolute).expect("declared");
    assert!(function.flags().contains(DeclFlags::METHOD));
    assert_eq!(lib.call_method(absolute, -7, &[])?, Value::Int(7));
    Ok(())
}

#[test]
fn test_manual_wrap_pre_and_post_processing() -> Result<(), DynbindError> {
    let mut lib = libc();
    let labs = lib.declare_function(
        FunctionDecl::new("labs")
            .param("n", AbiType::I64)
            .returns(AbiType::I64)
            .wrap_with(|raw, args| {
                let doubled = args[0].as_int().unwrap_or(0) * 2;
                let direct = raw.invoke()?;
                let replaced = raw.call(&[Value::Int(doubled)])?;
                let sum = direct.as_int().unwrap_or(0) + replaced.as_int().unwrap_or(0);
                Ok(Value::Int(sum))
            }),
    )?;
    lib.bind()?;

    assert_eq!(lib.call(labs, &[Value::Int(-4)])?, Value::Int(12));
    assert_eq!(lib.invoke("labs", &[Value::Int(-4)])?, Value::Int(12));
    Ok(())
}
