//! The builtin function registry (spec.md §6.3), plus the unsafe-only subset
//! (§6.3 "Unsafe builtins").
//!
//! Grounded on the `make_prims!` macro pattern (`types::entity`): a single
//! macro builds a `Copy` enum plus `from_str`/`as_str` tables so adding a
//! builtin is a one-line declaration instead of a hand-written match arm in
//! four different places.

macro_rules! make_builtin_enum {
  ($(#[$attr0:meta])* enum $name:ident { $($variant:ident: $text:literal),* $(,)? }) => {
    $(#[$attr0])*
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum $name { $($variant),* }

    impl $name {
      #[must_use] pub fn as_str(self) -> &'static str {
        match self { $($name::$variant => $text),* }
      }
      #[must_use] pub fn from_str(s: &str) -> Option<Self> {
        match s { $($text => Some($name::$variant),)* _ => None }
      }
      #[must_use] pub fn all() -> &'static [$name] { &[$($name::$variant),*] }
    }
  };
}

make_builtin_enum! {
  /// Every non-unsafe builtin named in spec.md §6.3.
  enum Builtin {
    Print: "print", Println: "println", Len: "len", Str: "str", Int: "int", Float: "float", Bool: "bool",
    Upper: "upper", Lower: "lower", Trim: "trim", Ltrim: "ltrim", Rtrim: "rtrim",
    StartsWith: "starts_with", EndsWith: "ends_with", Substring: "substring", Replace: "replace",
    Split: "split", Join: "join", Contains: "contains", IndexOf: "index_of", LastIndexOf: "last_index_of",
    CharAt: "char_at", Repeat: "repeat", ReverseStr: "reverse_str", IsDigit: "is_digit", IsAlpha: "is_alpha",
    Ord: "ord", Chr: "chr", Range: "range", Push: "push", Pop: "pop", First: "first", Last: "last",
    Get: "get", Reverse: "reverse", Index: "index", Includes: "includes", Take: "take", Drop: "drop",
    MinOf: "min_of", MaxOf: "max_of", Abs: "abs", Min: "min", Max: "max", Sqrt: "sqrt", Floor: "floor",
    Ceil: "ceil", Round: "round", Pow: "pow", Sin: "sin", Cos: "cos", Tan: "tan", Exp: "exp", Log: "log",
    Trunc: "trunc", Sign: "sign", Clamp: "clamp", Lerp: "lerp", Gcd: "gcd", Lcm: "lcm", Factorial: "factorial",
    Fib: "fib", Random: "random", IsNan: "is_nan", IsInf: "is_inf",
    Complex: "complex", Real: "real", Imag: "imag",
    Bigint: "bigint", BigintAdd: "bigint_add", BigintToInt: "bigint_to_int",
    Rational: "rational", RationalAdd: "rational_add", RationalToFloat: "rational_to_float",
    Fixed: "fixed", FixedAdd: "fixed_add", FixedSub: "fixed_sub", FixedMul: "fixed_mul", FixedToFloat: "fixed_to_float",
    Vec3: "vec3", Vec3Add: "vec3_add", Vec3Dot: "vec3_dot", Vec3Length: "vec3_length",
    Ok: "Ok", Err: "Err", IsOk: "is_ok", IsErr: "is_err", Unwrap: "unwrap", UnwrapOr: "unwrap_or",
    Open: "open", Read: "read", Write: "write", Close: "close", FileSize: "file_size",
    Platform: "platform", Arch: "arch", Hostname: "hostname", Username: "username", CpuCount: "cpu_count",
    Sleep: "sleep", Now: "now", NowMs: "now_ms", NowUs: "now_us", Year: "year", Month: "month", Day: "day",
    Hour: "hour", Minute: "minute", Second: "second", Weekday: "weekday", DayOfYear: "day_of_year",
    MakeTime: "make_time", AddDays: "add_days", AddHours: "add_hours", DiffDays: "diff_days",
    IsLeapYear: "is_leap_year", Env: "env", SetEnv: "set_env", HomeDir: "home_dir", TempDir: "temp_dir",
    Assert: "assert", Panic: "panic", Debug: "debug", System: "system",
    GcCollect: "gc_collect", GcStats: "gc_stats", GcCount: "gc_count",
    Sizeof: "sizeof", Alignof: "alignof", Offsetof: "offsetof",
    MutexLock: "mutex_lock", MutexUnlock: "mutex_unlock", RwlockRead: "rwlock_read", RwlockWrite: "rwlock_write",
    RwlockUnlock: "rwlock_unlock", CondWait: "cond_wait", CondSignal: "cond_signal", CondBroadcast: "cond_broadcast",
    SemAcquire: "sem_acquire", SemRelease: "sem_release", SemTryAcquire: "sem_try_acquire",
  }
}

make_builtin_enum! {
  /// Builtins the checker rejects outside an `unsafe { }` block.
  enum UnsafeBuiltin {
    New: "new", SetAllocator: "set_allocator", ResetAllocator: "reset_allocator",
    GcPin: "gc_pin", GcUnpin: "gc_unpin", GcAddRoot: "gc_add_root", GcRemoveRoot: "gc_remove_root",
    Memcpy: "memcpy", Memset: "memset", Memmove: "memmove", Memcmp: "memcmp",
    Alloc: "alloc", Free: "free", Stackalloc: "stackalloc", PlacementNew: "placement_new",
    AllocatorStats: "allocator_stats", AllocatorPeak: "allocator_peak",
  }
}

/// Smart-pointer instance methods dispatched before module/trait/instance
/// method resolution (spec.md §4.7 call dispatch order).
pub const SMART_PTR_METHODS: &[&str] = &[
  "clone", "deref", "get", "strong_count", "downgrade", "upgrade",
  "borrow", "borrow_mut", "set", "replace", "into_inner",
];

/// Atomic instance methods, same dispatch tier as smart-pointer methods.
pub const ATOMIC_METHODS: &[&str] = &[
  "load", "store", "swap", "cas", "add", "sub", "and", "or", "xor",
  "fetch_add", "fetch_sub", "fetch_and", "fetch_or", "fetch_xor",
];

#[must_use] pub fn is_unsafe_builtin_name(name: &str) -> bool { UnsafeBuiltin::from_str(name).is_some() }

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn roundtrips_through_str() {
    for &b in Builtin::all() {
      assert_eq!(Builtin::from_str(b.as_str()), Some(b));
    }
  }

  #[test]
  fn unsafe_builtins_are_flagged() {
    assert!(is_unsafe_builtin_name("memcpy"));
    assert!(!is_unsafe_builtin_name("print"));
  }
}
