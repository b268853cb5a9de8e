use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ContractError;

/// Upstream payment providers whose callbacks are ingested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Mpesa,
    Paystack,
    Mtn,
    Airtel,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::Mpesa,
        Provider::Paystack,
        Provider::Mtn,
        Provider::Airtel,
    ];

    /// Path segment and metric label for this provider
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Mpesa => "mpesa",
            Provider::Paystack => "paystack",
            Provider::Mtn => "mtn",
            Provider::Airtel => "airtel",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = ContractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mpesa" | "m-pesa" => Ok(Provider::Mpesa),
            "paystack" => Ok(Provider::Paystack),
            "mtn" | "mtn-momo" | "momo" => Ok(Provider::Mtn),
            "airtel" | "airtel-money" => Ok(Provider::Airtel),
            other => Err(ContractError::UnknownProvider(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_round_trips_path_segment() {
        for p in Provider::ALL {
            assert_eq!(p.as_str().parse::<Provider>().unwrap(), p);
        }
    }

    #[test]
    fn test_provider_aliases() {
        assert_eq!("M-Pesa".parse::<Provider>().unwrap(), Provider::Mpesa);
        assert_eq!("momo".parse::<Provider>().unwrap(), Provider::Mtn);
        assert!("stripe".parse::<Provider>().is_err());
    }
}
