use serde::{Deserialize, Serialize};

/// One priced leg of a journey: per-seat fare times seat count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FareLeg {
    pub fare_cents: i64,
    pub seats: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FareQuote {
    pub gross_cents: i64,
    pub discount_cents: i64,
    pub net_cents: i64,
    /// Agent commission, derived back from the discounted total.
    pub commission_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Percentage taken off the gross fare for agent sales (and paid back to
    /// the agent as commission).
    pub agent_discount_percent: i64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            agent_discount_percent: 10,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PricingError {
    #[error("Invalid discount percentage: {0}")]
    InvalidPercentage(i64),

    #[error("Negative amount: {0}")]
    NegativeAmount(i64),

    #[error("Fare overflow")]
    Overflow,
}

pub struct PricingEngine {
    config: PricingConfig,
}

impl PricingEngine {
    pub fn new(config: PricingConfig) -> Result<Self, PricingError> {
        check_percent(config.agent_discount_percent)?;
        Ok(Self { config })
    }

    /// Price all legs; agent sales get the configured discount and a
    /// matching commission.
    pub fn quote(&self, legs: &[FareLeg], agent_sale: bool) -> Result<FareQuote, PricingError> {
        let mut gross: i64 = 0;
        for leg in legs {
            gross = gross
                .checked_add(leg_total(leg.fare_cents, leg.seats)?)
                .ok_or(PricingError::Overflow)?;
        }

        if !agent_sale {
            return Ok(FareQuote {
                gross_cents: gross,
                discount_cents: 0,
                net_cents: gross,
                commission_cents: 0,
            });
        }

        let pct = self.config.agent_discount_percent;
        let net = apply_agent_discount(gross, pct)?;
        Ok(FareQuote {
            gross_cents: gross,
            discount_cents: gross - net,
            net_cents: net,
            commission_cents: commission_from_net(net, pct)?,
        })
    }
}

pub fn leg_total(fare_cents: i64, seats: usize) -> Result<i64, PricingError> {
    if fare_cents < 0 {
        return Err(PricingError::NegativeAmount(fare_cents));
    }
    let seats = i64::try_from(seats).map_err(|_| PricingError::Overflow)?;
    fare_cents.checked_mul(seats).ok_or(PricingError::Overflow)
}

/// `gross - round(gross * pct / 100)`, rounding half up.
pub fn apply_agent_discount(gross_cents: i64, pct: i64) -> Result<i64, PricingError> {
    check_percent(pct)?;
    if gross_cents < 0 {
        return Err(PricingError::NegativeAmount(gross_cents));
    }
    let scaled = gross_cents.checked_mul(pct).ok_or(PricingError::Overflow)?;
    let discount = (scaled + 50) / 100;
    Ok(gross_cents - discount)
}

/// Reverses a `pct`-off sale: the amount that was taken off a gross price
/// whose discounted total is `net_cents`. For 10% this is `net / 9`.
pub fn commission_from_net(net_cents: i64, pct: i64) -> Result<i64, PricingError> {
    check_percent(pct)?;
    if net_cents < 0 {
        return Err(PricingError::NegativeAmount(net_cents));
    }
    let denominator = 100 - pct;
    let numerator = net_cents.checked_mul(pct).ok_or(PricingError::Overflow)?;
    Ok((numerator * 2 + denominator) / (denominator * 2))
}

fn check_percent(pct: i64) -> Result<(), PricingError> {
    if !(0..100).contains(&pct) {
        return Err(PricingError::InvalidPercentage(pct));
    }
    Ok(())
}
