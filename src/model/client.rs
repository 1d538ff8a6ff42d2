use std::time::Duration;

use url::form_urlencoded;

use crate::util::now_millis;
use crate::{Error, Result};

/// Who a client claims to be when it joins a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub room_id: String,
    pub client_id: String,
    pub secret: String,
}

impl Identity {
    pub fn new(room_id: &str, client_id: &str, secret: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            client_id: client_id.to_string(),
            secret: secret.to_string(),
        }
    }

    /// Parse `roomId`, `clientId` and `clientSecret` (or `secret`) from a
    /// query string. Empty values count as missing.
    pub fn from_query(query: &str) -> Result<Self> {
        let mut room_id = None;
        let mut client_id = None;
        let mut secret = None;

        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "roomId" => room_id = Some(value.into_owned()),
                "clientId" => client_id = Some(value.into_owned()),
                "clientSecret" => secret = Some(value.into_owned()),
                "secret" if secret.is_none() => secret = Some(value.into_owned()),
                _ => {}
            }
        }

        Ok(Self {
            room_id: room_id.ok_or(Error::MissingArgument("roomId"))?,
            client_id: client_id.ok_or(Error::MissingArgument("clientId"))?,
            secret: secret.ok_or(Error::MissingArgument("clientSecret"))?,
        })
    }

    pub fn to_query(&self) -> String {
        form_urlencoded::Serializer::new(String::new())
            .append_pair("roomId", &self.room_id)
            .append_pair("clientId", &self.client_id)
            .append_pair("clientSecret", &self.secret)
            .finish()
    }
}

/// A client as the directory of one room sees it.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub client_id: String,
    pub secret: String,
    last_seen: u64,
}

impl ClientRecord {
    pub fn new(client_id: &str, secret: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            secret: secret.to_string(),
            last_seen: now_millis(),
        }
    }

    pub fn authenticates(&self, secret: &str) -> bool {
        self.secret == secret
    }

    /// Refresh on any liveness signal.
    pub fn touch(&mut self) {
        self.last_seen = now_millis();
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        now_millis().saturating_sub(self.last_seen) < ttl.as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_from_query() {
        let id = Identity::from_query("roomId=r1&clientId=c%201&clientSecret=s3cr3t").unwrap();
        assert_eq!(id, Identity::new("r1", "c 1", "s3cr3t"));

        let alias = Identity::from_query("secret=x&clientId=c&roomId=r").unwrap();
        assert_eq!(alias.secret, "x");

        let back = Identity::from_query(&id.to_query()).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_identity_missing_arguments() {
        assert!(matches!(
            Identity::from_query("clientId=c&secret=s"),
            Err(Error::MissingArgument("roomId"))
        ));
        assert!(matches!(
            Identity::from_query("roomId=r&clientId=&secret=s"),
            Err(Error::MissingArgument("clientId"))
        ));
        assert!(matches!(
            Identity::from_query("roomId=r&clientId=c"),
            Err(Error::MissingArgument("clientSecret"))
        ));
    }

    #[test]
    fn test_record_freshness() {
        let mut record = ClientRecord::new("c1", "s");
        assert!(record.authenticates("s"));
        assert!(!record.authenticates("t"));
        assert!(record.is_fresh(Duration::from_secs(6)));
        assert!(!record.is_fresh(Duration::ZERO));
        record.touch();
        assert!(record.last_seen() > 0);
    }
}
