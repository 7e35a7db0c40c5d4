//! Raw fault records and the code/name tables.

// =============================================================================
// FaultCode
// =============================================================================

/// Hardware exception codes the fault layer knows by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultCode {
    AccessViolation,
    ArrayBoundsExceeded,
    Breakpoint,
    DatatypeMisalignment,
    FltDenormalOperand,
    FltDivideByZero,
    FltInexactResult,
    FltInvalidOperation,
    FltOverflow,
    FltStackCheck,
    FltUnderflow,
    IllegalInstruction,
    InPageError,
    IntDivideByZero,
    IntOverflow,
    InvalidDisposition,
    NoncontinuableException,
    PrivInstruction,
    SingleStep,
    StackOverflow,
    /// Any other code.
    Unknown(u32),
}

impl FaultCode {
    /// Decode an OS exception code.
    pub fn from_raw(code: u32) -> Self {
        match code {
            0xC000_0005 => FaultCode::AccessViolation,
            0xC000_008C => FaultCode::ArrayBoundsExceeded,
            0x8000_0003 => FaultCode::Breakpoint,
            0x8000_0002 => FaultCode::DatatypeMisalignment,
            0xC000_008D => FaultCode::FltDenormalOperand,
            0xC000_008E => FaultCode::FltDivideByZero,
            0xC000_008F => FaultCode::FltInexactResult,
            0xC000_0090 => FaultCode::FltInvalidOperation,
            0xC000_0091 => FaultCode::FltOverflow,
            0xC000_0092 => FaultCode::FltStackCheck,
            0xC000_0093 => FaultCode::FltUnderflow,
            0xC000_001D => FaultCode::IllegalInstruction,
            0xC000_0006 => FaultCode::InPageError,
            0xC000_0094 => FaultCode::IntDivideByZero,
            0xC000_0095 => FaultCode::IntOverflow,
            0xC000_0026 => FaultCode::InvalidDisposition,
            0xC000_0025 => FaultCode::NoncontinuableException,
            0xC000_0096 => FaultCode::PrivInstruction,
            0x8000_0004 => FaultCode::SingleStep,
            0xC000_00FD => FaultCode::StackOverflow,
            other => FaultCode::Unknown(other),
        }
    }

    /// The OS exception code.
    pub fn raw(self) -> u32 {
        match self {
            FaultCode::AccessViolation => 0xC000_0005,
            FaultCode::ArrayBoundsExceeded => 0xC000_008C,
            FaultCode::Breakpoint => 0x8000_0003,
            FaultCode::DatatypeMisalignment => 0x8000_0002,
            FaultCode::FltDenormalOperand => 0xC000_008D,
            FaultCode::FltDivideByZero => 0xC000_008E,
            FaultCode::FltInexactResult => 0xC000_008F,
            FaultCode::FltInvalidOperation => 0xC000_0090,
            FaultCode::FltOverflow => 0xC000_0091,
            FaultCode::FltStackCheck => 0xC000_0092,
            FaultCode::FltUnderflow => 0xC000_0093,
            FaultCode::IllegalInstruction => 0xC000_001D,
            FaultCode::InPageError => 0xC000_0006,
            FaultCode::IntDivideByZero => 0xC000_0094,
            FaultCode::IntOverflow => 0xC000_0095,
            FaultCode::InvalidDisposition => 0xC000_0026,
            FaultCode::NoncontinuableException => 0xC000_0025,
            FaultCode::PrivInstruction => 0xC000_0096,
            FaultCode::SingleStep => 0x8000_0004,
            FaultCode::StackOverflow => 0xC000_00FD,
            FaultCode::Unknown(code) => code,
        }
    }

    /// Symbolic name used in fatal reports.
    pub fn name(self) -> &'static str {
        match self {
            FaultCode::AccessViolation => "EXCEPTION_ACCESS_VIOLATION",
            FaultCode::ArrayBoundsExceeded => "EXCEPTION_ARRAY_BOUNDS_EXCEEDED",
            FaultCode::Breakpoint => "EXCEPTION_BREAKPOINT",
            FaultCode::DatatypeMisalignment => "EXCEPTION_DATATYPE_MISALIGNMENT",
            FaultCode::FltDenormalOperand => "EXCEPTION_FLT_DENORMAL_OPERAND",
            FaultCode::FltDivideByZero => "EXCEPTION_FLT_DIVIDE_BY_ZERO",
            FaultCode::FltInexactResult => "EXCEPTION_FLT_INEXACT_RESULT",
            FaultCode::FltInvalidOperation => "EXCEPTION_FLT_INVALID_OPERATION",
            FaultCode::FltOverflow => "EXCEPTION_FLT_OVERFLOW",
            FaultCode::FltStackCheck => "EXCEPTION_FLT_STACK_CHECK",
            FaultCode::FltUnderflow => "EXCEPTION_FLT_UNDERFLOW",
            FaultCode::IllegalInstruction => "EXCEPTION_ILLEGAL_INSTRUCTION",
            FaultCode::InPageError => "EXCEPTION_IN_PAGE_ERROR",
            FaultCode::IntDivideByZero => "EXCEPTION_INT_DIVIDE_BY_ZERO",
            FaultCode::IntOverflow => "EXCEPTION_INT_OVERFLOW",
            FaultCode::InvalidDisposition => "EXCEPTION_INVALID_DISPOSITION",
            FaultCode::NoncontinuableException => "EXCEPTION_NONCONTINUABLE_EXCEPTION",
            FaultCode::PrivInstruction => "EXCEPTION_PRIV_INSTRUCTION",
            FaultCode::SingleStep => "EXCEPTION_SINGLE_STEP",
            FaultCode::StackOverflow => "EXCEPTION_STACK_OVERFLOW",
            FaultCode::Unknown(_) => "UNKNOWN",
        }
    }
}

// =============================================================================
// FaultRecord
// =============================================================================

/// How an access violation touched memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// Exception record of a synchronous fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    /// Exception code.
    pub code: FaultCode,
    /// Record flags; nonzero for nested or non-continuable records.
    pub flags: u32,
    /// Address of the faulting instruction.
    pub address: usize,
    /// First two exception-information words.
    ///
    /// For access violations: `[access kind, data address]`.
    pub info: [usize; 2],
}

impl FaultRecord {
    /// A continuable fault with no extra information.
    pub fn new(code: FaultCode, address: usize) -> Self {
        FaultRecord {
            code,
            flags: 0,
            address,
            info: [0; 2],
        }
    }

    /// A continuable access violation.
    pub fn access_violation(address: usize, access: AccessKind, data_address: usize) -> Self {
        let kind = match access {
            AccessKind::Read => 0,
            AccessKind::Write => 1,
            AccessKind::Execute => 8,
        };
        FaultRecord {
            code: FaultCode::AccessViolation,
            flags: 0,
            address,
            info: [kind, data_address],
        }
    }

    /// Access kind of an access violation.
    pub fn access_kind(&self) -> Option<AccessKind> {
        if self.code != FaultCode::AccessViolation {
            return None;
        }
        match self.info[0] {
            0 => Some(AccessKind::Read),
            1 => Some(AccessKind::Write),
            8 => Some(AccessKind::Execute),
            _ => None,
        }
    }

    /// Data address of an access violation.
    #[inline]
    pub fn data_address(&self) -> usize {
        self.info[1]
    }
}

// =============================================================================
// CrtSignal
// =============================================================================

/// C runtime signal numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrtSignal {
    Int,
    Ill,
    AbrtCompat,
    Fpe,
    Segv,
    Term,
    Break,
    Abrt,
    Other(i32),
}

impl CrtSignal {
    /// Decode a CRT signal number.
    pub fn from_raw(sig: i32) -> Self {
        match sig {
            2 => CrtSignal::Int,
            4 => CrtSignal::Ill,
            6 => CrtSignal::AbrtCompat,
            8 => CrtSignal::Fpe,
            11 => CrtSignal::Segv,
            15 => CrtSignal::Term,
            21 => CrtSignal::Break,
            22 => CrtSignal::Abrt,
            other => CrtSignal::Other(other),
        }
    }

    /// The CRT signal number.
    pub fn raw(self) -> i32 {
        match self {
            CrtSignal::Int => 2,
            CrtSignal::Ill => 4,
            CrtSignal::AbrtCompat => 6,
            CrtSignal::Fpe => 8,
            CrtSignal::Segv => 11,
            CrtSignal::Term => 15,
            CrtSignal::Break => 21,
            CrtSignal::Abrt => 22,
            CrtSignal::Other(sig) => sig,
        }
    }

    /// Signal name, `?` if unknown.
    pub fn name(self) -> &'static str {
        match self {
            CrtSignal::Int => "SIGINT",
            CrtSignal::Ill => "SIGILL",
            CrtSignal::AbrtCompat => "SIGABRT_COMPAT",
            CrtSignal::Fpe => "SIGFPE",
            CrtSignal::Segv => "SIGSEGV",
            CrtSignal::Term => "SIGTERM",
            CrtSignal::Break => "SIGBREAK",
            CrtSignal::Abrt => "SIGABRT",
            CrtSignal::Other(_) => "?",
        }
    }

    /// Exit status used when a signal terminates the process.
    #[inline]
    pub fn exit_status(self) -> i32 {
        128 + self.raw()
    }
}

/// FPE sub-code for integer division by zero.
pub const FPE_ZERODIVIDE: i32 = 0x83;

// =============================================================================
// Tests
// =============================================================================
