//! Engine executable discovery and header verification.
//!
//! The executable may live in several install locations; the locator walks
//! them in order and accepts the first candidate whose ELF header checks out.
//! Verification only inspects bytes, it never executes the file, so it is
//! side-effect-free and safe to repeat.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use object::elf;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{ENGINE_BINARY_NAME, EnginePaths};
use crate::errors::SupervisorError;

/// Number of header bytes needed for verification:
/// `e_ident` (16) + `e_type` (2) + `e_machine` (2).
pub const HEADER_LEN: usize = 20;

/// `e_machine` value expected for the host CPU.
#[cfg(target_arch = "x86_64")]
pub const HOST_MACHINE: u16 = elf::EM_X86_64;
#[cfg(target_arch = "aarch64")]
pub const HOST_MACHINE: u16 = elf::EM_AARCH64;
#[cfg(target_arch = "arm")]
pub const HOST_MACHINE: u16 = elf::EM_ARM;
#[cfg(target_arch = "riscv64")]
pub const HOST_MACHINE: u16 = elf::EM_RISCV;

/// Where an executable candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOrigin {
    /// Preinstalled library directory, executable by the OS loader.
    PreinstalledLibraryDir,
    /// Copy in app-private storage.
    AppPrivateStorage,
    /// Copy placed into the process-private cache directory as a last resort.
    FallbackCacheCopy,
}

/// One possible location of the engine executable.
///
/// Immutable once selected for a launch attempt.
#[derive(Debug, Clone)]
pub struct ExecutableCandidate {
    pub path: PathBuf,
    pub origin: CandidateOrigin,
}

/// A specific header field that failed verification.
///
/// The variants name the disagreeing field so support reports can say exactly
/// what was wrong with the artifact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("header truncated: {actual} bytes, need at least {HEADER_LEN}")]
    TooShort { actual: usize },

    #[error("magic mismatch: expected {expected:02x?}, got {actual:02x?}")]
    Magic { expected: [u8; 4], actual: [u8; 4] },

    #[error("class mismatch: expected ELFCLASS64 ({expected}), got {actual}")]
    Class { expected: u8, actual: u8 },

    #[error("architecture mismatch: expected e_machine {expected:#06x}, got {actual:#06x}")]
    Machine { expected: u16, actual: u16 },

    #[error("type mismatch: expected position-independent ET_DYN ({expected:#06x}), got {actual:#06x}")]
    NotPositionIndependent { expected: u16, actual: u16 },
}

/// Verify an ELF header prefix: magic, 64-bit class, host architecture, and
/// position-independent type marker. All four must match.
pub fn validate_header(bytes: &[u8]) -> Result<(), ValidationError> {
    if bytes.len() < HEADER_LEN {
        return Err(ValidationError::TooShort {
            actual: bytes.len(),
        });
    }

    let magic: [u8; 4] = bytes[0..4].try_into().expect("slice is 4 bytes");
    if magic != elf::ELFMAG {
        return Err(ValidationError::Magic {
            expected: elf::ELFMAG,
            actual: magic,
        });
    }

    let class = bytes[4];
    if class != elf::ELFCLASS64 {
        return Err(ValidationError::Class {
            expected: elf::ELFCLASS64,
            actual: class,
        });
    }

    let machine = u16::from_le_bytes([bytes[18], bytes[19]]);
    if machine != HOST_MACHINE {
        return Err(ValidationError::Machine {
            expected: HOST_MACHINE,
            actual: machine,
        });
    }

    let e_type = u16::from_le_bytes([bytes[16], bytes[17]]);
    if e_type != elf::ET_DYN {
        return Err(ValidationError::NotPositionIndependent {
            expected: elf::ET_DYN,
            actual: e_type,
        });
    }

    Ok(())
}

/// Verify the executable at `path` by reading its header prefix.
pub fn validate(path: &Path) -> Result<(), SupervisorError> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut header = [0u8; HEADER_LEN];
    let mut read = 0;
    while read < HEADER_LEN {
        match file.read(&mut header[read..])? {
            0 => break,
            n => read += n,
        }
    }
    validate_header(&header[..read]).map_err(SupervisorError::from)
}

/// Ordered candidate locations for the engine executable.
pub fn candidates(paths: &EnginePaths) -> Vec<ExecutableCandidate> {
    vec![
        ExecutableCandidate {
            path: paths.library_dir.join(ENGINE_BINARY_NAME),
            origin: CandidateOrigin::PreinstalledLibraryDir,
        },
        ExecutableCandidate {
            path: paths.private_dir.join(ENGINE_BINARY_NAME),
            origin: CandidateOrigin::AppPrivateStorage,
        },
        ExecutableCandidate {
            path: paths.cache_dir.join(ENGINE_BINARY_NAME),
            origin: CandidateOrigin::FallbackCacheCopy,
        },
    ]
}

/// Find the first candidate that exists and passes header verification.
///
/// Candidates that exist but fail verification are logged with the field
/// diagnostic and skipped; if nothing passes, the last diagnostic (when any
/// candidate existed) is returned so the failure names the bad field.
pub fn locate_executable(paths: &EnginePaths) -> Result<ExecutableCandidate, SupervisorError> {
    let mut last_invalid: Option<SupervisorError> = None;

    for candidate in candidates(paths) {
        if !candidate.path.is_file() {
            debug!(path = %candidate.path.display(), "engine candidate absent");
            continue;
        }
        match validate(&candidate.path) {
            Ok(()) => {
                debug!(
                    path = %candidate.path.display(),
                    origin = ?candidate.origin,
                    "engine candidate accepted"
                );
                return Ok(candidate);
            }
            Err(err) => {
                warn!(
                    path = %candidate.path.display(),
                    origin = ?candidate.origin,
                    %err,
                    "engine candidate rejected"
                );
                last_invalid = Some(err);
            }
        }
    }

    Err(last_invalid.unwrap_or(SupervisorError::BinaryMissing))
}

/// Materialize the fallback cache copy from the first existing source
/// candidate, with owner-only permissions.
///
/// Used when the OS refuses to execute from the library or private-storage
/// locations; the copy carries the same bytes that already passed
/// verification at locate time.
pub fn fallback_candidate(paths: &EnginePaths) -> Result<ExecutableCandidate, SupervisorError> {
    let sources = [
        paths.library_dir.join(ENGINE_BINARY_NAME),
        paths.private_dir.join(ENGINE_BINARY_NAME),
    ];
    let source = sources
        .iter()
        .find(|p| p.is_file())
        .ok_or(SupervisorError::BinaryMissing)?;

    std::fs::create_dir_all(&paths.cache_dir)?;
    std::fs::set_permissions(&paths.cache_dir, std::fs::Permissions::from_mode(0o700))?;

    let target = paths.cache_dir.join(ENGINE_BINARY_NAME);
    std::fs::copy(source, &target)?;
    std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o700))?;

    debug!(
        source = %source.display(),
        target = %target.display(),
        "materialized fallback engine copy"
    );

    Ok(ExecutableCandidate {
        path: target,
        origin: CandidateOrigin::FallbackCacheCopy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal header prefix with the given fields.
    fn header(magic: [u8; 4], class: u8, e_type: u16, machine: u16) -> Vec<u8> {
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(&magic);
        bytes[4] = class;
        bytes[5] = elf::ELFDATA2LSB;
        bytes[16..18].copy_from_slice(&e_type.to_le_bytes());
        bytes[18..20].copy_from_slice(&machine.to_le_bytes());
        bytes
    }

    fn good_header() -> Vec<u8> {
        header(elf::ELFMAG, elf::ELFCLASS64, elf::ET_DYN, HOST_MACHINE)
    }

    #[test]
    fn accepts_matching_header() {
        assert_eq!(validate_header(&good_header()), Ok(()));
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = header([b'M', b'Z', 0, 0], elf::ELFCLASS64, elf::ET_DYN, HOST_MACHINE);
        assert!(matches!(
            validate_header(&bytes),
            Err(ValidationError::Magic { .. })
        ));
    }

    #[test]
    fn rejects_32_bit_class() {
        let bytes = header(elf::ELFMAG, elf::ELFCLASS32, elf::ET_DYN, HOST_MACHINE);
        assert_eq!(
            validate_header(&bytes),
            Err(ValidationError::Class {
                expected: elf::ELFCLASS64,
                actual: elf::ELFCLASS32,
            })
        );
    }

    #[test]
    fn rejects_foreign_architecture() {
        let foreign = if HOST_MACHINE == elf::EM_AARCH64 {
            elf::EM_X86_64
        } else {
            elf::EM_AARCH64
        };
        let bytes = header(elf::ELFMAG, elf::ELFCLASS64, elf::ET_DYN, foreign);
        assert!(matches!(
            validate_header(&bytes),
            Err(ValidationError::Machine { actual, .. }) if actual == foreign
        ));
    }

    #[test]
    fn rejects_non_pie_executable() {
        let bytes = header(elf::ELFMAG, elf::ELFCLASS64, elf::ET_EXEC, HOST_MACHINE);
        assert!(matches!(
            validate_header(&bytes),
            Err(ValidationError::NotPositionIndependent { .. })
        ));
    }

    #[test]
    fn rejects_truncated_header() {
        assert_eq!(
            validate_header(&good_header()[..10]),
            Err(ValidationError::TooShort { actual: 10 })
        );
    }

    #[test]
    fn diagnostics_name_the_disagreeing_field() {
        let cases = [
            (
                header([0, 0, 0, 0], elf::ELFCLASS64, elf::ET_DYN, HOST_MACHINE),
                "magic",
            ),
            (
                header(elf::ELFMAG, elf::ELFCLASS32, elf::ET_DYN, HOST_MACHINE),
                "class",
            ),
            (
                header(elf::ELFMAG, elf::ELFCLASS64, elf::ET_DYN, 0xffff),
                "architecture",
            ),
            (
                header(elf::ELFMAG, elf::ELFCLASS64, elf::ET_EXEC, HOST_MACHINE),
                "type",
            ),
        ];
        for (bytes, field) in cases {
            let err = validate_header(&bytes).unwrap_err();
            assert!(
                err.to_string().contains(field),
                "expected {field:?} in {err}"
            );
        }
    }

    #[test]
    fn locate_prefers_earlier_candidates() {
        let root = tempfile::tempdir().unwrap();
        let paths = EnginePaths::under(root.path());
        std::fs::create_dir_all(&paths.library_dir).unwrap();
        std::fs::create_dir_all(&paths.private_dir).unwrap();
        std::fs::write(paths.library_dir.join(ENGINE_BINARY_NAME), good_header()).unwrap();
        std::fs::write(paths.private_dir.join(ENGINE_BINARY_NAME), good_header()).unwrap();

        let found = locate_executable(&paths).unwrap();
        assert_eq!(found.origin, CandidateOrigin::PreinstalledLibraryDir);
    }

    #[test]
    fn locate_skips_invalid_and_accepts_next() {
        let root = tempfile::tempdir().unwrap();
        let paths = EnginePaths::under(root.path());
        std::fs::create_dir_all(&paths.library_dir).unwrap();
        std::fs::create_dir_all(&paths.private_dir).unwrap();
        std::fs::write(paths.library_dir.join(ENGINE_BINARY_NAME), b"not an elf").unwrap();
        std::fs::write(paths.private_dir.join(ENGINE_BINARY_NAME), good_header()).unwrap();

        let found = locate_executable(&paths).unwrap();
        assert_eq!(found.origin, CandidateOrigin::AppPrivateStorage);
    }

    #[test]
    fn locate_reports_missing_when_nothing_exists() {
        let root = tempfile::tempdir().unwrap();
        let paths = EnginePaths::under(root.path());
        assert!(matches!(
            locate_executable(&paths),
            Err(SupervisorError::BinaryMissing)
        ));
    }

    #[test]
    fn locate_reports_last_diagnostic_when_all_invalid() {
        let root = tempfile::tempdir().unwrap();
        let paths = EnginePaths::under(root.path());
        std::fs::create_dir_all(&paths.library_dir).unwrap();
        // Long enough to clear the length check and fail on the magic field.
        std::fs::write(
            paths.library_dir.join(ENGINE_BINARY_NAME),
            b"garbage bytes, definitely not an elf header",
        )
        .unwrap();

        assert!(matches!(
            locate_executable(&paths),
            Err(SupervisorError::BinaryInvalid(ValidationError::Magic { .. }))
        ));
    }

    #[test]
    fn fallback_copy_gets_owner_only_permissions() {
        let root = tempfile::tempdir().unwrap();
        let paths = EnginePaths::under(root.path());
        std::fs::create_dir_all(&paths.private_dir).unwrap();
        std::fs::write(paths.private_dir.join(ENGINE_BINARY_NAME), good_header()).unwrap();

        let fallback = fallback_candidate(&paths).unwrap();
        assert_eq!(fallback.origin, CandidateOrigin::FallbackCacheCopy);
        assert!(fallback.path.starts_with(&paths.cache_dir));

        let mode = std::fs::metadata(&fallback.path)
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn fallback_without_source_reports_missing() {
        let root = tempfile::tempdir().unwrap();
        let paths = EnginePaths::under(root.path());
        assert!(matches!(
            fallback_candidate(&paths),
            Err(SupervisorError::BinaryMissing)
        ));
    }
}
