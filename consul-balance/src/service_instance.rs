use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// A single healthy instance of a service as reported by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// The registry's service id, when it reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    /// Host name or ip the instance listens on.
    address: String,
    /// The service port.
    port: u16,
    /// Whether all the instance health checks are passing.
    passing: bool,
}

impl ServiceInstance {
    /// Create a passing [`ServiceInstance`] from an `address` and `port`.
    pub fn from_parts<T: ToString>(address: T, port: u16) -> Self {
        Self {
            id: None,
            address: address.to_string(),
            port,
            passing: true,
        }
    }

    /// Attach the registry's service id.
    pub fn with_id<T: ToString>(self, id: T) -> Self {
        Self {
            id: Some(id.to_string()),
            ..self
        }
    }

    /// Override the health flag.
    pub fn with_passing(self, passing: bool) -> Self {
        Self { passing, ..self }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_passing(&self) -> bool {
        self.passing
    }

    /// Render the `host:port` authority of this instance.
    ///
    /// IPv6 addresses are wrapped in brackets so that the result can be used in a URL.
    pub fn authority(&self) -> String {
        match self.address.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.port).to_string(),
            Err(_) => format!("{}:{}", self.address, self.port),
        }
    }
}

/// ```
/// let instance = consul_balance::ServiceInstance::from(("10.0.0.1", 8080));
/// assert_eq!(instance.address(), "10.0.0.1");
/// assert_eq!(instance.port(), 8080);
/// assert!(instance.is_passing());
/// ```
impl From<(&str, u16)> for ServiceInstance {
    fn from((address, port): (&str, u16)) -> Self {
        Self::from_parts(address, port)
    }
}

impl From<SocketAddr> for ServiceInstance {
    fn from(addr: SocketAddr) -> Self {
        Self::from_parts(addr.ip(), addr.port())
    }
}

/// The ordered list of instances delivered together by one watch event or query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceSnapshot(Vec<ServiceInstance>);

impl InstanceSnapshot {
    pub fn new(instances: Vec<ServiceInstance>) -> Self {
        Self(instances)
    }

    pub fn instances(&self) -> &[ServiceInstance] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_instances(self) -> Vec<ServiceInstance> {
        self.0
    }

    /// Compute the [`Fingerprint`] of this snapshot.
    ///
    /// Instances are sorted before hashing, so two deliveries holding the same
    /// instances in a different order share a fingerprint.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut canonical: Vec<&ServiceInstance> = self.0.iter().collect();
        canonical.sort_by(|a, b| {
            (a.address.as_str(), a.port, a.id.as_deref(), a.passing).cmp(&(
                b.address.as_str(),
                b.port,
                b.id.as_deref(),
                b.passing,
            ))
        });

        // Serializing plain strings, integers and booleans cannot fail.
        let serialized = serde_json::to_vec(&canonical).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(&serialized);
        Fingerprint(hex::encode(hasher.finalize()))
    }
}

impl From<Vec<ServiceInstance>> for InstanceSnapshot {
    fn from(instances: Vec<ServiceInstance>) -> Self {
        Self(instances)
    }
}

impl FromIterator<ServiceInstance> for InstanceSnapshot {
    fn from_iter<I: IntoIterator<Item = ServiceInstance>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a InstanceSnapshot {
    type Item = &'a ServiceInstance;
    type IntoIter = std::slice::Iter<'a, ServiceInstance>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Hex encoded SHA-256 digest over a serialized [`InstanceSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
