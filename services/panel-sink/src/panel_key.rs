use crate::error::SinkError;

/// Which separator a panel key was encoded with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormat {
    /// Current encoding: `{dashboard}:{panel}`
    Colon,
    /// Legacy encoding: `{dashboard}_{panel}`
    Underscore,
}

impl KeyFormat {
    fn separator(self) -> char {
        match self {
            KeyFormat::Colon => ':',
            KeyFormat::Underscore => '_',
        }
    }
}

/// Composite record key identifying one rendered panel of one dashboard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelKey {
    pub dashboard_id: String,
    pub panel_name: String,
    pub format: KeyFormat,
}

impl PanelKey {
    /// Decode a record key.
    ///
    /// A key containing `:` is split on its first colon; any other key is
    /// split on its first underscore. Both halves must be non-empty.
    pub fn decode(key: &str) -> Result<Self, SinkError> {
        let format = if key.contains(':') {
            KeyFormat::Colon
        } else {
            KeyFormat::Underscore
        };

        let malformed = || SinkError::MalformedKey {
            key: key.to_string(),
        };

        let (dashboard_id, panel_name) = key.split_once(format.separator()).ok_or_else(malformed)?;

        if dashboard_id.is_empty() || panel_name.is_empty() {
            return Err(malformed());
        }

        Ok(Self {
            dashboard_id: dashboard_id.to_string(),
            panel_name: panel_name.to_string(),
            format,
        })
    }

    /// Destination object name in the panel bucket
    pub fn object_name(&self) -> String {
        format!("{}_{}.png", self.dashboard_id, self.panel_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_colon_key() {
        let key = PanelKey::decode("dash1:panelA").unwrap();
        assert_eq!(key.dashboard_id, "dash1");
        assert_eq!(key.panel_name, "panelA");
        assert_eq!(key.format, KeyFormat::Colon);
    }

    #[test]
    fn test_decode_colon_splits_on_first_only() {
        let key = PanelKey::decode("dash1:panel:A").unwrap();
        assert_eq!(key.dashboard_id, "dash1");
        assert_eq!(key.panel_name, "panel:A");
    }

    #[test]
    fn test_colon_takes_precedence_over_underscore() {
        let key = PanelKey::decode("my_dash:panel_a").unwrap();
        assert_eq!(key.dashboard_id, "my_dash");
        assert_eq!(key.panel_name, "panel_a");
        assert_eq!(key.format, KeyFormat::Colon);
    }

    #[test]
    fn test_decode_legacy_underscore_key() {
        let key = PanelKey::decode("A_B_C").unwrap();
        assert_eq!(key.dashboard_id, "A");
        assert_eq!(key.panel_name, "B_C");
        assert_eq!(key.format, KeyFormat::Underscore);
    }

    #[test]
    fn test_decode_without_separator_fails() {
        let err = PanelKey::decode("dashboard-panel").unwrap_err();
        assert!(matches!(err, SinkError::MalformedKey { ref key } if key == "dashboard-panel"));
        assert!(PanelKey::decode("").is_err());
    }

    #[test]
    fn test_decode_rejects_empty_halves() {
        assert!(PanelKey::decode(":panel").is_err());
        assert!(PanelKey::decode("dash:").is_err());
        assert!(PanelKey::decode("_panel").is_err());
    }

    #[test]
    fn test_object_name() {
        assert_eq!(
            PanelKey::decode("dash1_panelA").unwrap().object_name(),
            "dash1_panelA.png"
        );
        assert_eq!(
            PanelKey::decode("my-dashboard:panel-name").unwrap().object_name(),
            "my-dashboard_panel-name.png"
        );
    }
}
