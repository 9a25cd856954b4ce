//! Backend selection from CLI --backend flag.

use crate::error::{Result, StreamError};

/// Backend a binary should drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Simulated accelerator, always available.
    Host,
    /// OpenCL device `device` of platform `platform`.
    OpenCl { platform: usize, device: usize },
}

/// Resolve a backend from the --backend CLI flag.
///
/// Accepted values: "host" (default), "opencl", "opencl:<platform>:<device>".
pub fn resolve_backend(name: Option<&str>) -> Result<BackendKind> {
    match name.unwrap_or("host") {
        "host" => Ok(BackendKind::Host),
        other if other == "opencl" || other.starts_with("opencl:") => {
            let kind = parse_opencl(other)?;
            if cfg!(feature = "opencl") {
                Ok(kind)
            } else {
                Err(StreamError::Configuration(
                    "OpenCL backend not available (compile with --features opencl)".to_string(),
                ))
            }
        }
        other => Err(StreamError::Configuration(format!(
            "Unknown backend '{}'. Options: host, opencl[:platform:device]",
            other
        ))),
    }
}

fn parse_opencl(name: &str) -> Result<BackendKind> {
    let mut parts = name.split(':').skip(1);
    let mut index = |what: &str| -> Result<usize> {
        match parts.next() {
            None => Ok(0),
            Some(p) => p.parse().map_err(|_| {
                StreamError::Configuration(format!("invalid OpenCL {} index '{}'", what, p))
            }),
        }
    };
    let platform = index("platform")?;
    let device = index("device")?;
    Ok(BackendKind::OpenCl { platform, device })
}
