use std::sync::OnceLock;
use std::{fmt, fmt::Display};

use tracing::{debug, info};

pub const DISABLE_HWACCEL_ENV: &str = "TRANSCODE_HW_DISABLE_HWACCEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcceleratorFamily {
    Qsv,
    Nvidia,
}

impl AcceleratorFamily {
    pub const ALL: [Self; 2] = [Self::Qsv, Self::Nvidia];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Qsv => "qsv",
            Self::Nvidia => "nvidia",
        }
    }
}

impl Display for AcceleratorFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait CapabilityOracle: Send + Sync {
    fn is_supported(&self, family: AcceleratorFamily) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityReport {
    pub qsv: bool,
    pub nvidia: bool,
}

impl CapabilityReport {
    pub fn collect(oracle: &dyn CapabilityOracle) -> Self {
        Self {
            qsv: oracle.is_supported(AcceleratorFamily::Qsv),
            nvidia: oracle.is_supported(AcceleratorFamily::Nvidia),
        }
    }
}

impl Display for CapabilityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapabilityReport(qsv={}, nvidia={})", self.qsv, self.nvidia)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticCapabilities {
    supported: Vec<AcceleratorFamily>,
}

impl StaticCapabilities {
    #[must_use]
    pub fn new(supported: &[AcceleratorFamily]) -> Self {
        Self {
            supported: supported.to_vec(),
        }
    }

    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn all() -> Self {
        Self::new(&AcceleratorFamily::ALL)
    }
}

impl CapabilityOracle for StaticCapabilities {
    fn is_supported(&self, family: AcceleratorFamily) -> bool {
        self.supported.contains(&family)
    }
}

type Probe = Box<dyn Fn(AcceleratorFamily) -> bool + Send + Sync>;

pub struct ProbedCapabilities {
    probe: Probe,
    disabled: bool,
    qsv: OnceLock<bool>,
    nvidia: OnceLock<bool>,
}

impl ProbedCapabilities {
    /// Honours `TRANSCODE_HW_DISABLE_HWACCEL=1`, which reports every family
    /// as unsupported without running the probe.
    pub fn new<F>(probe: F) -> Self
    where
        F: Fn(AcceleratorFamily) -> bool + Send + Sync + 'static,
    {
        Self::with_override(probe, hwaccel_disabled_by_env())
    }

    pub fn with_override<F>(probe: F, disabled: bool) -> Self
    where
        F: Fn(AcceleratorFamily) -> bool + Send + Sync + 'static,
    {
        if disabled {
            info!("hardware acceleration disabled, skipping accelerator probes");
        }
        Self {
            probe: Box::new(probe),
            disabled,
            qsv: OnceLock::new(),
            nvidia: OnceLock::new(),
        }
    }

    fn slot(&self, family: AcceleratorFamily) -> &OnceLock<bool> {
        match family {
            AcceleratorFamily::Qsv => &self.qsv,
            AcceleratorFamily::Nvidia => &self.nvidia,
        }
    }
}

impl CapabilityOracle for ProbedCapabilities {
    fn is_supported(&self, family: AcceleratorFamily) -> bool {
        if self.disabled {
            return false;
        }
        *self.slot(family).get_or_init(|| {
            let supported = (self.probe)(family);
            debug!("accelerator probe: {} supported={}", family, supported);
            supported
        })
    }
}

impl fmt::Debug for ProbedCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbedCapabilities")
            .field("disabled", &self.disabled)
            .field("qsv", &self.qsv.get())
            .field("nvidia", &self.nvidia.get())
            .finish()
    }
}

fn hwaccel_disabled_by_env() -> bool {
    std::env::var(DISABLE_HWACCEL_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
