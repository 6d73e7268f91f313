//! The font subsetter's native contract: entry-point signatures, the `fontsub.h`
//! constant set, and the allocation-callback triple shared between host and foreign
//! code.
//!
//! # The allocator boundary
//!
//! Both entry points take an allocate/reallocate/free callback triple and return
//! output buffers allocated through it. The loader also installs the same three
//! functions over the image's own allocator imports, so every heap block crossing
//! the call boundary — in either direction — belongs to the one host allocator and
//! can be released by either side. [`AllocCallbacks::host_heap`] is that triple;
//! [`cfp_alloc`], [`cfp_realloc`] and [`cfp_free`] are the functions behind it.
//!
//! # Calling convention
//!
//! The image is 32-bit x86 and its entry points are `cdecl`; `extern "C"` matches
//! that on an x86 host process. Loading and patching work on any host, but actually
//! invoking the entry points requires a 32-bit x86 build of the driver.

use std::ptr;

use libc::{c_ulong, c_void};
use log::trace;

use crate::{loader::LoadedLibrary, Error, Result};

/// Name of the subset-creation export.
pub const CREATE_EXPORT: &str = "CreateFontPackage";
/// Name of the package-merge export.
pub const MERGE_EXPORT: &str = "MergeFontPackage";

/* for usSubsetFormat */
/// Straight subset font, for backward compatibility.
pub const TTFCFP_SUBSET: u16 = 0;
/// Subset font with full TTO and kern tables, for later merge.
pub const TTFCFP_SUBSET1: u16 = 1;
/// Delta font, for merge with a subset1 font.
pub const TTFCFP_DELTA: u16 = 2;

/* for usSubsetPlatform */
/// Unicode platform ID.
pub const TTFCFP_UNICODE_PLATFORMID: u16 = 0;
/// Apple platform ID.
pub const TTFCFP_APPLE_PLATFORMID: u16 = 1;
/// ISO platform ID.
pub const TTFCFP_ISO_PLATFORMID: u16 = 2;
/// Microsoft platform ID.
pub const TTFCFP_MS_PLATFORMID: u16 = 3;

/* for usSubsetEncoding */
/// Standard Mac character set; goes with the Apple platform ID.
pub const TTFCFP_STD_MAC_CHAR_SET: u16 = 0;
/// Symbol character set; goes with the Microsoft platform ID.
pub const TTFCFP_SYMBOL_CHAR_SET: u16 = 0;
/// Unicode character set; goes with the Microsoft platform ID.
pub const TTFCFP_UNICODE_CHAR_SET: u16 = 1;
/// Any encoding.
pub const TTFCFP_DONT_CARE: u16 = 0xFFFF;

/* for usSubsetLanguage */
/// Keep all language-specific records.
pub const TTFCFP_LANG_KEEP_ALL: u16 = 0;

/* for usFlags */
/// If off, don't subset.
pub const TTFCFP_FLAGS_SUBSET: u16 = 0x0001;
/// If off, don't compress.
pub const TTFCFP_FLAGS_COMPRESS: u16 = 0x0002;
/// If off, the source is a TTF rather than a TTC.
pub const TTFCFP_FLAGS_TTC: u16 = 0x0004;
/// If off, the keep list holds characters rather than glyphs.
pub const TTFCFP_FLAGS_GLYPHLIST: u16 = 0x0008;

/* for usModes */
/// Copy a straight subset font package to the destination buffer.
pub const TTFMFP_SUBSET: u16 = 0;
/// Expand a format 1 font into a format 3 font.
pub const TTFMFP_SUBSET1: u16 = 1;
/// Merge a format 2 font with a format 3 font.
pub const TTFMFP_DELTA: u16 = 2;

/// `CFP_ALLOCPROC`: allocate a block.
pub type AllocFn = unsafe extern "C" fn(usize) -> *mut c_void;
/// `CFP_REALLOCPROC`: resize a block.
pub type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
/// `CFP_FREEPROC`: release a block.
pub type FreeFn = unsafe extern "C" fn(*mut c_void);

/// `CreateFontPackage`: source buffer and subsetting parameters in, package
/// buffer/size/bytes-written out, allocator triple, reserved pointer.
pub type CreateFontPackageFn = unsafe extern "C" fn(
    *const u8,    // puchSrcBuffer
    c_ulong,      // ulSrcBufferSize
    *mut *mut u8, // ppuchFontPackageBuffer
    *mut c_ulong, // pulFontPackageBufferSize
    *mut c_ulong, // pulBytesWritten
    u16,          // usFlag
    u16,          // usTTCIndex
    u16,          // usSubsetFormat
    u16,          // usSubsetLanguage
    u16,          // usSubsetPlatform
    u16,          // usSubsetEncoding
    *const u16,   // pusSubsetKeepList
    u16,          // usSubsetListCount
    AllocFn,
    ReallocFn,
    FreeFn,
    *mut c_void, // lpvReserved
) -> c_ulong;

/// `MergeFontPackage`: one or two input buffers and a mode in, merged
/// buffer/size/bytes-written out, allocator triple, reserved pointer.
pub type MergeFontPackageFn = unsafe extern "C" fn(
    *const u8,    // puchMergeFontBuffer
    c_ulong,      // ulMergeFontBufferSize
    *const u8,    // puchFontPackageBuffer
    c_ulong,      // ulFontPackageBufferSize
    *mut *mut u8, // ppuchDestBuffer
    *mut c_ulong, // pulDestBufferSize
    *mut c_ulong, // pulBytesWritten
    u16,          // usMode
    AllocFn,
    ReallocFn,
    FreeFn,
    *mut c_void, // lpvReserved
) -> c_ulong;

/// Host-side `CFP_ALLOCPROC`: the image's `malloc` and the callback triple's
/// allocate both land here.
///
/// # Safety
///
/// Called through a C function pointer; the contract is `malloc`'s.
pub unsafe extern "C" fn cfp_alloc(size: usize) -> *mut c_void {
    let ptr = libc::malloc(size);
    trace!("[A] malloc({:#x}) ---> {:?}", size, ptr);
    ptr
}

/// Host-side `CFP_REALLOCPROC`.
///
/// # Safety
///
/// Called through a C function pointer; the contract is `realloc`'s.
pub unsafe extern "C" fn cfp_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    let out = libc::realloc(ptr, size);
    trace!("[A] realloc({:?}, {:#x}) ---> {:?}", ptr, size, out);
    out
}

/// Host-side `CFP_FREEPROC`.
///
/// # Safety
///
/// Called through a C function pointer; the contract is `free`'s.
pub unsafe extern "C" fn cfp_free(ptr: *mut c_void) {
    trace!("[A] free({:?})", ptr);
    libc::free(ptr);
}

/// The allocate/reallocate/free triple passed to every entry-point call.
#[derive(Clone, Copy)]
pub struct AllocCallbacks {
    /// Allocation callback.
    pub alloc: AllocFn,
    /// Reallocation callback.
    pub realloc: ReallocFn,
    /// Release callback.
    pub free: FreeFn,
}

impl AllocCallbacks {
    /// The host-heap triple — the same functions the loader installs over the
    /// image's allocator imports.
    #[must_use]
    pub fn host_heap() -> Self {
        AllocCallbacks {
            alloc: cfp_alloc,
            realloc: cfp_realloc,
            free: cfp_free,
        }
    }
}

impl Default for AllocCallbacks {
    fn default() -> Self {
        Self::host_heap()
    }
}

/// Parameters for one `CreateFontPackage` call.
#[derive(Debug, Clone)]
pub struct SubsetRequest {
    /// `usFlag` bits (`TTFCFP_FLAGS_*`).
    pub flags: u16,
    /// Face index for TTC sources.
    pub ttc_index: u16,
    /// Output format (`TTFCFP_SUBSET`, `TTFCFP_SUBSET1`, `TTFCFP_DELTA`).
    pub format: u16,
    /// `usSubsetLanguage`.
    pub language: u16,
    /// `usSubsetPlatform`.
    pub platform: u16,
    /// `usSubsetEncoding`.
    pub encoding: u16,
    /// Characters or glyphs to keep.
    pub keep_list: Vec<u16>,
}

impl SubsetRequest {
    /// A minimal valid request for the given output format.
    #[must_use]
    pub fn new(format: u16) -> Self {
        SubsetRequest {
            flags: TTFCFP_FLAGS_SUBSET,
            ttc_index: 0,
            format,
            language: TTFCFP_LANG_KEEP_ALL,
            platform: TTFCFP_UNICODE_PLATFORMID,
            encoding: TTFCFP_DONT_CARE,
            keep_list: vec![0],
        }
    }
}

/// Result of one entry-point call.
///
/// A nonzero status is an ordinary outcome when feeding the subsetter corrupt
/// fonts, so it is data here, not an error.
#[derive(Debug, Clone, Default)]
pub struct CallOutcome {
    /// The entry point's return value; 0 is success.
    pub status: u32,
    /// The returned buffer, copied out and released; empty on failure.
    pub output: Vec<u8>,
}

impl CallOutcome {
    /// Whether the foreign code reported success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == 0
    }
}

/// The two resolved entry points plus the callback triple to call them with.
#[derive(Clone, Copy)]
pub struct FontSubsetter {
    create: CreateFontPackageFn,
    merge: MergeFontPackageFn,
    callbacks: AllocCallbacks,
}

impl FontSubsetter {
    /// Binds the subsetter to a loaded image's resolved exports.
    ///
    /// # Errors
    ///
    /// [`Error::MissingExport`] if the library was loaded without requiring the
    /// subsetter's two entry points.
    ///
    /// # Safety
    ///
    /// The caller asserts the library's exports really are `CreateFontPackage` and
    /// `MergeFontPackage` with the documented signatures, and that the host process
    /// can execute the image's 32-bit x86 code.
    pub unsafe fn from_library(library: &LoadedLibrary) -> Result<Self> {
        let create = library
            .export_address(CREATE_EXPORT)
            .ok_or_else(|| Error::MissingExport(CREATE_EXPORT.to_string()))?;
        let merge = library
            .export_address(MERGE_EXPORT)
            .ok_or_else(|| Error::MissingExport(MERGE_EXPORT.to_string()))?;

        Ok(FontSubsetter {
            create: std::mem::transmute::<usize, CreateFontPackageFn>(create as usize),
            merge: std::mem::transmute::<usize, MergeFontPackageFn>(merge as usize),
            callbacks: AllocCallbacks::host_heap(),
        })
    }

    /// The callback triple this subsetter passes to the foreign code.
    #[must_use]
    pub fn callbacks(&self) -> AllocCallbacks {
        self.callbacks
    }

    /// Calls `CreateFontPackage` over `source`.
    ///
    /// Any returned buffer is copied out and immediately released through the
    /// callback triple; the foreign allocation never escapes.
    ///
    /// # Safety
    ///
    /// Executes foreign code. The image decides what happens; a corrupt input can
    /// hang or crash the process.
    pub unsafe fn create(&self, source: &[u8], request: &SubsetRequest) -> CallOutcome {
        let mut buffer: *mut u8 = ptr::null_mut();
        let mut buffer_size: c_ulong = 0;
        let mut written: c_ulong = 0;

        let status = (self.create)(
            source.as_ptr(),
            source.len() as c_ulong,
            &mut buffer,
            &mut buffer_size,
            &mut written,
            request.flags,
            request.ttc_index,
            request.format,
            request.language,
            request.platform,
            request.encoding,
            request.keep_list.as_ptr(),
            request.keep_list.len() as u16,
            self.callbacks.alloc,
            self.callbacks.realloc,
            self.callbacks.free,
            ptr::null_mut(),
        );

        self.collect(status, buffer, written)
    }

    /// Calls `MergeFontPackage` over an optional working font and a package.
    ///
    /// # Safety
    ///
    /// Executes foreign code; see [`FontSubsetter::create`].
    pub unsafe fn merge(
        &self,
        merge_font: Option<&[u8]>,
        package: &[u8],
        mode: u16,
    ) -> CallOutcome {
        let (merge_ptr, merge_len) = match merge_font {
            Some(font) => (font.as_ptr(), font.len() as c_ulong),
            None => (ptr::null(), 0),
        };
        let mut buffer: *mut u8 = ptr::null_mut();
        let mut buffer_size: c_ulong = 0;
        let mut written: c_ulong = 0;

        let status = (self.merge)(
            merge_ptr,
            merge_len,
            package.as_ptr(),
            package.len() as c_ulong,
            &mut buffer,
            &mut buffer_size,
            &mut written,
            mode,
            self.callbacks.alloc,
            self.callbacks.realloc,
            self.callbacks.free,
            ptr::null_mut(),
        );

        self.collect(status, buffer, written)
    }

    /// Copies a returned buffer out and releases it through the triple.
    unsafe fn collect(&self, status: c_ulong, buffer: *mut u8, written: c_ulong) -> CallOutcome {
        let output = if status == 0 && !buffer.is_null() {
            let copied = std::slice::from_raw_parts(buffer, written as usize).to_vec();
            (self.callbacks.free)(buffer.cast::<c_void>());
            copied
        } else {
            Vec::new()
        };
        CallOutcome {
            status: status as u32,
            output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_match_the_sdk_header() {
        assert_eq!(TTFCFP_SUBSET, 0);
        assert_eq!(TTFCFP_SUBSET1, 1);
        assert_eq!(TTFCFP_DELTA, 2);
        assert_eq!(TTFCFP_FLAGS_SUBSET, 0x0001);
        assert_eq!(TTFCFP_FLAGS_COMPRESS, 0x0002);
        assert_eq!(TTFCFP_FLAGS_TTC, 0x0004);
        assert_eq!(TTFCFP_FLAGS_GLYPHLIST, 0x0008);
        assert_eq!(TTFCFP_DONT_CARE, 0xFFFF);
        assert_eq!(TTFMFP_SUBSET, 0);
        assert_eq!(TTFMFP_SUBSET1, 1);
        assert_eq!(TTFMFP_DELTA, 2);
    }

    #[test]
    fn test_host_heap_round_trip() {
        // The triple really is the host allocator: a block from alloc can be
        // resized and released through the other two.
        unsafe {
            let block = cfp_alloc(32);
            assert!(!block.is_null());
            let block = cfp_realloc(block, 64);
            assert!(!block.is_null());
            cfp_free(block);
        }
    }

    #[test]
    fn test_default_request_is_minimal_subset() {
        let request = SubsetRequest::new(TTFCFP_SUBSET1);
        assert_eq!(request.format, TTFCFP_SUBSET1);
        assert_eq!(request.flags, TTFCFP_FLAGS_SUBSET);
        assert_eq!(request.platform, TTFCFP_UNICODE_PLATFORMID);
        assert_eq!(request.encoding, TTFCFP_DONT_CARE);
        assert!(!request.keep_list.is_empty());
    }

    #[test]
    fn test_call_outcome_success_flag() {
        assert!(CallOutcome::default().is_success());
        let failed = CallOutcome {
            status: 1007,
            output: Vec::new(),
        };
        assert!(!failed.is_success());
    }
}
