//! Room naming for the push channel.
//!
//! Subscription filters are folded into the room name, so the hub evaluates
//! a filter once per room per broadcast instead of once per connection.
//!
//! Names:
//! - `user:<id>`, `tenant:<id>`, `provider:<name>`
//! - `sub:<scope>:<eventType>` optionally followed by `?<filter>`, where
//!   scope is `tenant=<id>`, `global` (events without a tenant) or `all`
//!
//! Free-form components (tenant ids, currencies, countries) are
//! percent-encoded so reserved characters survive a parse.

use payment_contracts::{PaymentEvent, PaymentEventType, Provider};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub fn user_room(user_id: &str) -> String {
    format!("user:{user_id}")
}

pub fn tenant_room(tenant_id: &str) -> String {
    format!("tenant:{tenant_id}")
}

pub fn provider_room(provider: Provider) -> String {
    format!("provider:{provider}")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionFilter {
    #[serde(default)]
    pub providers: Vec<Provider>,
    #[serde(default)]
    pub currencies: Vec<String>,
    /// ISO 3166 alpha-2
    #[serde(default)]
    pub countries: Vec<String>,
    #[serde(default)]
    pub min_amount: Option<Decimal>,
    #[serde(default)]
    pub max_amount: Option<Decimal>,
}

/// Country of the customer's phone number, by calling code
fn country_for_calling_code(code: &str) -> Option<&'static str> {
    Some(match code {
        "254" => "KE",
        "255" => "TZ",
        "256" => "UG",
        "250" => "RW",
        "234" => "NG",
        "233" => "GH",
        "27" => "ZA",
        "260" => "ZM",
        "265" => "MW",
        _ => return None,
    })
}

fn event_country(event: &PaymentEvent) -> Option<String> {
    if let Some(c) = event.metadata.get("country").and_then(|v| v.as_str()) {
        return Some(c.to_ascii_uppercase());
    }
    event
        .transaction
        .as_ref()
        .and_then(|t| t.customer.phone.as_ref())
        .and_then(|p| country_for_calling_code(&p.country_code))
        .map(str::to_string)
}

fn escape(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

fn unescape(value: &str) -> Option<String> {
    urlencoding::decode(value).ok().map(|v| v.into_owned())
}

fn escape_list(items: &[String]) -> String {
    items.iter().map(|i| escape(i)).collect::<Vec<_>>().join(",")
}

impl SubscriptionFilter {
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
            && self.currencies.is_empty()
            && self.countries.is_empty()
            && self.min_amount.is_none()
            && self.max_amount.is_none()
    }

    /// Canonical form, so equal filters always produce one room name.
    pub fn normalized(mut self) -> Self {
        self.providers.sort_by_key(|p| p.as_str());
        self.providers.dedup();
        for list in [&mut self.currencies, &mut self.countries] {
            for item in list.iter_mut() {
                *item = item.trim().to_ascii_uppercase();
            }
            list.retain(|i| !i.is_empty());
            list.sort();
            list.dedup();
        }
        self.min_amount = self.min_amount.map(|d| d.normalize());
        self.max_amount = self.max_amount.map(|d| d.normalize());
        self
    }

    pub fn encode(&self) -> String {
        let mut parts = Vec::new();
        if !self.providers.is_empty() {
            let names: Vec<&str> = self.providers.iter().map(|p| p.as_str()).collect();
            parts.push(format!("providers={}", names.join(",")));
        }
        if !self.currencies.is_empty() {
            parts.push(format!("currencies={}", escape_list(&self.currencies)));
        }
        if !self.countries.is_empty() {
            parts.push(format!("countries={}", escape_list(&self.countries)));
        }
        if let Some(min) = self.min_amount {
            parts.push(format!("min={min}"));
        }
        if let Some(max) = self.max_amount {
            parts.push(format!("max={max}"));
        }
        parts.join("&")
    }

    pub fn decode(encoded: &str) -> Option<Self> {
        let mut filter = Self::default();
        for part in encoded.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=')?;
            let list = || value.split(',').map(unescape).collect::<Option<Vec<_>>>();
            match key {
                "providers" => {
                    filter.providers = value
                        .split(',')
                        .map(Provider::from_str)
                        .collect::<Result<_, _>>()
                        .ok()?
                }
                "currencies" => filter.currencies = list()?,
                "countries" => filter.countries = list()?,
                "min" => filter.min_amount = Some(Decimal::from_str(value).ok()?),
                "max" => filter.max_amount = Some(Decimal::from_str(value).ok()?),
                _ => return None,
            }
        }
        Some(filter)
    }

    pub fn matches(&self, event: &PaymentEvent) -> bool {
        if !self.providers.is_empty() && !self.providers.contains(&event.provider) {
            return false;
        }

        let amount = event.transaction.as_ref().map(|t| &t.amount);
        if !self.currencies.is_empty()
            && !amount.is_some_and(|m| self.currencies.contains(&m.currency))
        {
            return false;
        }
        if let Some(min) = self.min_amount {
            if !amount.is_some_and(|m| m.amount >= min) {
                return false;
            }
        }
        if let Some(max) = self.max_amount {
            if !amount.is_some_and(|m| m.amount <= max) {
                return false;
            }
        }
        if !self.countries.is_empty()
            && !event_country(event).is_some_and(|c| self.countries.contains(&c))
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Tenant(String),
    /// Events that carry no tenant
    Global,
    /// Every event regardless of tenant
    All,
}

impl Scope {
    fn encode(&self) -> String {
        match self {
            Scope::Tenant(t) => format!("tenant={}", escape(t)),
            Scope::Global => "global".to_string(),
            Scope::All => "all".to_string(),
        }
    }

    fn decode(s: &str) -> Option<Self> {
        match s {
            "global" => Some(Scope::Global),
            "all" => Some(Scope::All),
            other => other
                .strip_prefix("tenant=")
                .filter(|t| !t.is_empty())
                .and_then(unescape)
                .map(Scope::Tenant),
        }
    }

    fn admits(&self, tenant_id: Option<&str>) -> bool {
        match self {
            Scope::Tenant(t) => tenant_id == Some(t.as_str()),
            Scope::Global => tenant_id.is_none(),
            Scope::All => true,
        }
    }
}

/// Parsed subscription room
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSpec {
    pub scope: Scope,
    pub event_type: PaymentEventType,
    pub filter: SubscriptionFilter,
}

impl RoomSpec {
    pub fn new(scope: Scope, event_type: PaymentEventType, filter: SubscriptionFilter) -> Self {
        Self {
            scope,
            event_type,
            filter: filter.normalized(),
        }
    }

    pub fn name(&self) -> String {
        let base = format!("sub:{}:{}", self.scope.encode(), self.event_type);
        if self.filter.is_empty() {
            base
        } else {
            format!("{base}?{}", self.filter.encode())
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_prefix("sub:")?;
        let (base, filter) = match rest.split_once('?') {
            Some((base, f)) => (base, SubscriptionFilter::decode(f)?),
            None => (rest, SubscriptionFilter::default()),
        };
        let (scope, event_type) = base.rsplit_once(':')?;
        Some(Self {
            scope: Scope::decode(scope)?,
            event_type: event_type.parse().ok()?,
            filter,
        })
    }

    pub fn matches(&self, event: &PaymentEvent) -> bool {
        self.event_type == event.event_type
            && self.scope.admits(event.tenant_id())
            && self.filter.matches(event)
    }
}
