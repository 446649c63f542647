//! Routing labels carried through the provider's label field
//!
//! Every compiled query is tagged with a label naming the Mackerel destination
//! (a service or a host) and the destination metric name. CloudWatch echoes the
//! label back on each result row, which is how a series finds its way home.
//!
//! Wire format: `service=<name>:<metric>` or `host=<id>:<metric>`.

use crate::error::LabelError;
use std::fmt;
use std::str::FromStr;

/// Where a forwarded metric is posted
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Destination {
    /// A Mackerel service metric, keyed by service name
    Service(String),
    /// A Mackerel host metric, keyed by host id
    Host(String),
}

impl Destination {
    /// Discriminator token used in the encoded label
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Service(_) => "service",
            Self::Host(_) => "host",
        }
    }

    /// Service name or host id
    pub fn id(&self) -> &str {
        match self {
            Self::Service(id) | Self::Host(id) => id,
        }
    }
}

/// Decoded routing label
///
/// Fields are private so a `Label` is always encodable: the destination id is
/// non-empty and free of `:`, and the metric name is non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Label {
    destination: Destination,
    metric_name: String,
}

impl Label {
    /// Create a validated label
    pub fn new(destination: Destination, metric_name: impl Into<String>) -> Result<Self, LabelError> {
        let metric_name = metric_name.into();
        let id = destination.id();
        if id.is_empty() {
            return Err(LabelError::EmptyDestination {
                label: format!("{}=:{}", destination.kind(), metric_name),
            });
        }
        if id.contains(':') {
            return Err(LabelError::InvalidDestination { id: id.to_string() });
        }
        if metric_name.is_empty() {
            return Err(LabelError::EmptyMetricName {
                label: format!("{}={}:", destination.kind(), id),
            });
        }
        Ok(Self {
            destination,
            metric_name,
        })
    }

    /// Label for a service metric
    pub fn service(
        service: impl Into<String>,
        metric_name: impl Into<String>,
    ) -> Result<Self, LabelError> {
        Self::new(Destination::Service(service.into()), metric_name)
    }

    /// Label for a host metric
    pub fn host(host_id: impl Into<String>, metric_name: impl Into<String>) -> Result<Self, LabelError> {
        Self::new(Destination::Host(host_id.into()), metric_name)
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    /// Encode into the wire format
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Parse a label from the wire format
    pub fn decode(s: &str) -> Result<Self, LabelError> {
        let Some(idx) = s.find(':') else {
            return Err(LabelError::MissingSeparator {
                label: s.to_string(),
            });
        };
        if idx == 0 {
            return Err(LabelError::MissingKind {
                label: s.to_string(),
            });
        }
        if idx == s.len() - 1 {
            return Err(LabelError::EmptyMetricName {
                label: s.to_string(),
            });
        }
        let (head, metric_name) = (&s[..idx], &s[idx + 1..]);

        let eq = match head.find('=') {
            Some(eq) if eq > 0 => eq,
            _ => {
                return Err(LabelError::MissingKind {
                    label: s.to_string(),
                });
            }
        };
        if eq == head.len() - 1 {
            return Err(LabelError::EmptyDestination {
                label: s.to_string(),
            });
        }
        let (kind, id) = (&head[..eq], &head[eq + 1..]);

        let destination = match kind {
            "service" => Destination::Service(id.to_string()),
            "host" => Destination::Host(id.to_string()),
            _ => {
                return Err(LabelError::UnknownKind {
                    label: s.to_string(),
                    kind: kind.to_string(),
                });
            }
        };

        Ok(Self {
            destination,
            metric_name: metric_name.to_string(),
        })
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={}:{}",
            self.destination.kind(),
            self.destination.id(),
            self.metric_name
        )
    }
}

impl FromStr for Label {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}
