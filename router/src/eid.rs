use super::*;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Empty endpoint identifier")]
    Empty,

    #[error("Unsupported scheme in '{0}'")]
    UnsupportedScheme(String),

    #[error("Invalid ipn endpoint '{0}'")]
    InvalidIpn(String),

    #[error("Missing node name in '{0}'")]
    MissingNode(String),
}

/// A well-known application endpoint on a node.
///
/// `dtn` scheme nodes address it by `name` (e.g. `dtn://node/routing`),
/// `ipn` scheme nodes by service `number` (e.g. `ipn:7.50`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Service {
    pub name: &'static str,
    pub number: u64,
}

/// Endpoint identifier, kept in its textual form.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "String", into = "String")
)]
pub struct Eid(Arc<str>);

const DTN_PREFIX: &str = "dtn://";
const IPN_PREFIX: &str = "ipn:";

impl Eid {
    pub fn none() -> Self {
        Self("dtn:none".into())
    }

    pub fn is_none(&self) -> bool {
        &*self.0 == "dtn:none"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn ipn_parts(&self) -> Option<(u64, u64)> {
        let (node, service) = self.0.strip_prefix(IPN_PREFIX)?.split_once('.')?;
        Some((node.parse().ok()?, service.parse().ok()?))
    }

    // Splits a dtn URI into "dtn://node" and "/application"
    fn dtn_split(&self) -> (&str, &str) {
        match self.0.strip_prefix(DTN_PREFIX) {
            Some(rest) => match rest.find('/') {
                Some(i) => self.0.split_at(DTN_PREFIX.len() + i),
                None => (&self.0, ""),
            },
            None => (&self.0, ""),
        }
    }

    /// The node part of this endpoint, with any application suffix stripped.
    pub fn node(&self) -> Eid {
        if let Some((node, service)) = self.ipn_parts() {
            if service == 0 {
                self.clone()
            } else {
                Eid(format!("{IPN_PREFIX}{node}.0").into())
            }
        } else {
            match self.dtn_split() {
                (_, "") => self.clone(),
                (node, _) => Eid(node.into()),
            }
        }
    }

    /// The application suffix of a `dtn` endpoint, e.g. `/routing`.
    pub fn application(&self) -> &str {
        self.dtn_split().1
    }

    pub fn same_node(&self, other: &Eid) -> bool {
        self.node() == other.node()
    }

    /// The endpoint of `service` on this endpoint's node.
    pub fn service(&self, service: &Service) -> Eid {
        if let Some((node, _)) = self.ipn_parts() {
            Eid(format!("{IPN_PREFIX}{node}.{}", service.number).into())
        } else if self.is_none() {
            self.clone()
        } else {
            Eid(format!("{}{}", self.dtn_split().0, service.name).into())
        }
    }

    pub fn is_service(&self, service: &Service) -> bool {
        match self.ipn_parts() {
            Some((_, number)) => number == service.number,
            None => self.application() == service.name,
        }
    }
}

impl std::str::FromStr for Eid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(Error::Empty)
        } else if s == "dtn:none" {
            Ok(Self::none())
        } else if let Some(rest) = s.strip_prefix(DTN_PREFIX) {
            match rest.split('/').next() {
                Some(node) if !node.is_empty() => Ok(Self(s.into())),
                _ => Err(Error::MissingNode(s.to_string())),
            }
        } else if let Some(rest) = s.strip_prefix(IPN_PREFIX) {
            let Some((node, service)) = rest.split_once('.') else {
                return Err(Error::InvalidIpn(s.to_string()));
            };
            let node = node
                .parse::<u64>()
                .map_err(|_| Error::InvalidIpn(s.to_string()))?;
            let service = service
                .parse::<u64>()
                .map_err(|_| Error::InvalidIpn(s.to_string()))?;
            Ok(Self(format!("{IPN_PREFIX}{node}.{service}").into()))
        } else {
            Err(Error::UnsupportedScheme(s.to_string()))
        }
    }
}

impl TryFrom<String> for Eid {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Eid> for String {
    fn from(value: Eid) -> Self {
        value.0.to_string()
    }
}

impl std::fmt::Display for Eid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for Eid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Eid({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTING: Service = Service {
        name: "/routing",
        number: 50,
    };

    fn eid(s: &str) -> Eid {
        s.parse().unwrap()
    }

    #[test]
    fn parse() {
        assert_eq!("".parse::<Eid>(), Err(Error::Empty));
        assert!(matches!(
            "http://x".parse::<Eid>(),
            Err(Error::UnsupportedScheme(_))
        ));
        assert!(matches!("dtn:///app".parse::<Eid>(), Err(Error::MissingNode(_))));
        assert!(matches!("ipn:1".parse::<Eid>(), Err(Error::InvalidIpn(_))));
        assert!(matches!("ipn:a.2".parse::<Eid>(), Err(Error::InvalidIpn(_))));
        assert!(eid("dtn:none").is_none());
        assert_eq!(eid("ipn:007.01").as_str(), "ipn:7.1");
    }

    #[test]
    fn node_and_application() {
        assert_eq!(eid("dtn://node/app/x").node(), eid("dtn://node"));
        assert_eq!(eid("dtn://node/app/x").application(), "/app/x");
        assert_eq!(eid("dtn://node").node(), eid("dtn://node"));
        assert_eq!(eid("dtn://node").application(), "");
        assert_eq!(eid("ipn:3.12").node(), eid("ipn:3.0"));
        assert!(eid("dtn://a/x").same_node(&eid("dtn://a/y")));
        assert!(!eid("dtn://a/x").same_node(&eid("dtn://ab/x")));
        assert!(eid("ipn:3.1").same_node(&eid("ipn:3.2")));
    }

    #[test]
    fn services() {
        assert_eq!(eid("dtn://n/app").service(&ROUTING), eid("dtn://n/routing"));
        assert_eq!(eid("ipn:4.0").service(&ROUTING), eid("ipn:4.50"));
        assert!(eid("dtn://n/routing").is_service(&ROUTING));
        assert!(eid("ipn:4.50").is_service(&ROUTING));
        assert!(!eid("dtn://n/other").is_service(&ROUTING));
    }
}
