use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// Fixed window length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    Minute,
    Hour,
}

impl Granularity {
    pub fn window(&self) -> Duration {
        match self {
            Granularity::Minute => Duration::from_secs(60),
            Granularity::Hour => Duration::from_secs(3600),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
        }
    }

    /// strftime pattern that floors a UTC time to this window
    fn bucket_format(&self) -> &'static str {
        match self {
            Granularity::Minute => "%Y%m%d%H%M",
            Granularity::Hour => "%Y%m%d%H",
        }
    }
}

/// Identifies one counter: subject, endpoint and the window it falls in
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateWindowKey {
    pub subject: String,
    pub endpoint: String,
    pub granularity: Granularity,
    pub bucket: String,
}

impl RateWindowKey {
    pub fn at(subject: &str, endpoint: &str, granularity: Granularity, now: DateTime<Utc>) -> Self {
        Self {
            subject: subject.to_string(),
            endpoint: endpoint.to_string(),
            granularity,
            bucket: now.format(granularity.bucket_format()).to_string(),
        }
    }
}

impl fmt::Display for RateWindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rate_limit:{}:{}:{}:{}",
            self.subject,
            self.endpoint,
            self.granularity.as_str(),
            self.bucket
        )
    }
}
