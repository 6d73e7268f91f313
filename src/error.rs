use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The severity model follows the load pipeline: conditions that would leave a partially
/// patched or wrongly protected image in memory ([`Error::SectionMap`], [`Error::Protect`])
/// abort the whole load, while per-slot and per-entry anomalies (unresolved imports,
/// unsupported relocation kinds) are recorded on the load result and never surface here.
/// Missing required exports are a logical failure of the load, not a process fault.
///
/// # Examples
///
/// ```rust,no_run
/// use winsub::{Error, LoadConfig, Loader};
///
/// let dll = std::fs::read("fontsub.dll")?;
/// match Loader::new(LoadConfig::new()).load(&dll) {
///     Ok(library) => println!("ready at {:#010x}", library.actual_base()),
///     Err(Error::MissingExport(name)) => eprintln!("export not found: {}", name),
///     Err(Error::Malformed { message, file, line }) => {
///         eprintln!("malformed image: {} ({}:{})", message, file, line)
///     }
///     Err(e) => eprintln!("load failed: {}", e),
/// }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The image is damaged and could not be parsed or laid out.
    ///
    /// Includes the source location where the malformation was detected for
    /// debugging purposes.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An access outside the mapped sections of the image was attempted.
    ///
    /// Every read and write of mapped image memory is bounds-checked against
    /// the section ranges; this is the rejection path.
    #[error("Access outside the mapped image ranges")]
    OutOfBounds,

    /// This image is not supported by the loader.
    ///
    /// Raised for PE32+ (64-bit) images and other formats outside the
    /// loader's deliberately narrow target set.
    #[error("Unsupported image: {0}")]
    NotSupported(String),

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Error from the goblin crate during PE parsing.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    /// A fixed-placement section mapping could not be established.
    ///
    /// Fatal for the whole load: a partially mapped image cannot safely be
    /// patched or executed.
    #[error("Fixed mapping at {addr:#010x} failed: {source}")]
    SectionMap {
        /// The absolute address the section had to occupy
        addr: u64,
        /// The underlying OS error
        source: std::io::Error,
    },

    /// Final page protection could not be applied to a section.
    ///
    /// Fatal: proceeding with wrong protection risks silent misbehavior of
    /// the loaded image.
    #[error("Protection change at {addr:#010x} failed: {source}")]
    Protect {
        /// The absolute address of the affected section
        addr: u64,
        /// The underlying OS error
        source: std::io::Error,
    },

    /// The chosen load address is not page-aligned.
    #[error("Load address {0:#010x} is not page-aligned")]
    MisalignedBase(u64),

    /// The chosen load address would place the image outside the 32-bit
    /// address range its pointer slots can express.
    #[error("Load address {0:#010x} places the image outside the 32-bit range")]
    BaseOutOfRange(u64),

    /// A required export is absent from the image's export directory.
    ///
    /// The load result is a logical failure; no entry point is ever invoked.
    #[error("Required export not found: {0}")]
    MissingExport(String),
}
