use core::ffi::c_void;

/// Register image captured by the interception wrapper.
///
/// The wrapper writes this struct directly on its own stack frame, so the
/// field order is part of the wrapper's code layout (see `attach_x86_64`).
/// `rsp` is the caller's stack pointer before the `call` that reached the
/// hooked function: stack argument `k` lives at `rsp + 8 * k`.
#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct X86_64CpuContext {
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    /// xmm0-xmm7, the System V floating-point argument registers.
    pub xmm: [u128; 8],
}

/// Invocation context passed to listeners.
#[repr(C)]
#[derive(Debug)]
pub struct InvocationContext {
    pub function: *mut c_void,
    #[cfg(target_arch = "x86_64")]
    pub cpu_context: *mut X86_64CpuContext,
    #[cfg(not(target_arch = "x86_64"))]
    pub cpu_context: *mut c_void,
    /// When set to true in on_enter, the original function is skipped and
    /// the return registers in `cpu_context` are handed back to the caller.
    pub skip_original: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HookError {
    #[error("failed to allocate executable memory")]
    AllocationFailed,
    #[error("failed to change memory protection at {0:#x}")]
    ProtectionFailed(usize),
    #[error("cannot relocate function prologue: {0}")]
    RelocationFailed(String),
    #[error("failed to assemble interception wrapper: {0}")]
    AssemblyFailed(String),
    #[error("no hook is attached at {0:#x}")]
    NotAttached(usize),
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),
    #[error("function interception is not supported on this platform")]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub path: String,
    pub base_address: usize,
    pub size: usize,
    /// Readable `PT_LOAD` segments as `(start, len)`, in load order.
    pub segments: Vec<(usize, usize)>,
}
