//! Checkout pricing.
//!
//! Pure arithmetic over line items and an optional destination; no I/O. Every
//! monetary component is rounded to cents before the total is derived, so
//! `total == subtotal + tax + shipping_fee - discount` holds exactly.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;

const MONEY_SCALE: u32 = 2;

/// Rounds a monetary amount to cents, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Tax and shipping rules, built once from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingPolicy {
    pub tax_rate: Decimal,
    /// Two-letter country code; destinations in it ship at the domestic fee.
    pub store_country: String,
    pub domestic_shipping_fee: Decimal,
    pub international_shipping_fee: Decimal,
    /// Discounted subtotals at or above this ship free.
    pub free_shipping_threshold: Option<Decimal>,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            tax_rate: dec!(0.11),
            store_country: "US".to_string(),
            domestic_shipping_fee: dec!(5),
            international_shipping_fee: dec!(20),
            free_shipping_threshold: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Discount {
    #[default]
    None,
    /// Flat amount off the subtotal.
    Fixed(Decimal),
    /// Percentage of the subtotal, 0 to 100.
    Percentage(Decimal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLine {
    pub unit_price: Decimal,
    pub quantity: i32,
}

impl PriceLine {
    pub fn new(unit_price: Decimal, quantity: i32) -> Self {
        Self {
            unit_price,
            quantity,
        }
    }

    pub fn subtotal(&self) -> Decimal {
        round_money(self.unit_price * Decimal::from(self.quantity))
    }
}

/// Where the order ships; only the country affects pricing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub country_code: String,
}

impl Destination {
    pub fn new(country_code: impl Into<String>) -> Self {
        Self {
            country_code: country_code.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingBreakdown {
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub shipping_fee: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
}

impl PricingBreakdown {
    /// Checks the stored total against its components and the given line subtotals.
    pub fn is_consistent_with<I>(&self, line_subtotals: I) -> bool
    where
        I: IntoIterator<Item = Decimal>,
    {
        let items: Decimal = line_subtotals.into_iter().sum();
        items == self.subtotal && self.total == items + self.tax + self.shipping_fee - self.discount
    }
}

#[derive(Debug, Clone)]
pub struct PricingCalculator {
    policy: PricingPolicy,
}

impl PricingCalculator {
    pub fn new(policy: PricingPolicy) -> Self {
        Self { policy }
    }

    /// Prices `lines` for an optional destination.
    ///
    /// Tax applies to the subtotal after discount. Shipping is zero without a
    /// destination. The discount is clamped to the subtotal.
    pub fn calculate(
        &self,
        lines: &[PriceLine],
        destination: Option<&Destination>,
        discount: Discount,
    ) -> Result<PricingBreakdown, ServiceError> {
        for line in lines {
            if line.quantity <= 0 {
                return Err(ServiceError::InvalidInput(format!(
                    "quantity must be positive, got {}",
                    line.quantity
                )));
            }
            if line.unit_price.is_sign_negative() {
                return Err(ServiceError::InvalidInput(
                    "unit price cannot be negative".to_string(),
                ));
            }
        }

        let subtotal: Decimal = lines.iter().map(PriceLine::subtotal).sum();
        let discount = self.discount_amount(subtotal, discount)?;
        let taxable = subtotal - discount;
        let tax = round_money(taxable * self.policy.tax_rate);
        let shipping_fee = self.shipping_fee(taxable, destination);

        Ok(PricingBreakdown {
            subtotal,
            tax,
            shipping_fee,
            discount,
            total: subtotal + tax + shipping_fee - discount,
        })
    }

    fn discount_amount(&self, subtotal: Decimal, discount: Discount) -> Result<Decimal, ServiceError> {
        let raw = match discount {
            Discount::None => Decimal::ZERO,
            Discount::Fixed(amount) => {
                if amount.is_sign_negative() {
                    return Err(ServiceError::InvalidInput(
                        "discount cannot be negative".to_string(),
                    ));
                }
                amount
            }
            Discount::Percentage(pct) => {
                if pct.is_sign_negative() || pct > dec!(100) {
                    return Err(ServiceError::InvalidInput(format!(
                        "discount percentage must be between 0 and 100, got {}",
                        pct
                    )));
                }
                subtotal * pct / dec!(100)
            }
        };
        Ok(round_money(raw.min(subtotal)))
    }

    fn shipping_fee(&self, taxable: Decimal, destination: Option<&Destination>) -> Decimal {
        let Some(destination) = destination else {
            return Decimal::ZERO;
        };
        if let Some(threshold) = self.policy.free_shipping_threshold {
            if taxable >= threshold {
                return Decimal::ZERO;
            }
        }
        let fee = if destination
            .country_code
            .eq_ignore_ascii_case(&self.policy.store_country)
        {
            self.policy.domestic_shipping_fee
        } else {
            self.policy.international_shipping_fee
        };
        round_money(fee)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn calculator() -> PricingCalculator {
        PricingCalculator::new(PricingPolicy::default())
    }

    #[test]
    fn no_address_means_no_shipping() {
        let pricing = calculator()
            .calculate(&[PriceLine::new(dec!(10000), 2)], None, Discount::None)
            .unwrap();
        assert_eq!(pricing.subtotal, dec!(20000));
        assert_eq!(pricing.tax, dec!(2200));
        assert_eq!(pricing.shipping_fee, Decimal::ZERO);
        assert_eq!(pricing.total, dec!(22200));
    }

    #[test]
    fn domestic_and_international_fees() {
        let lines = [PriceLine::new(dec!(19.99), 3)];
        let domestic = calculator()
            .calculate(&lines, Some(&Destination::new("us")), Discount::None)
            .unwrap();
        let abroad = calculator()
            .calculate(&lines, Some(&Destination::new("DE")), Discount::None)
            .unwrap();

        assert_eq!(domestic.subtotal, dec!(59.97));
        assert_eq!(domestic.tax, dec!(6.60));
        assert_eq!(domestic.shipping_fee, dec!(5));
        assert_eq!(abroad.shipping_fee, dec!(20));
        assert_eq!(abroad.total - domestic.total, dec!(15));
    }

    #[test]
    fn free_shipping_threshold_uses_discounted_subtotal() {
        let calc = PricingCalculator::new(PricingPolicy {
            free_shipping_threshold: Some(dec!(100)),
            ..PricingPolicy::default()
        });
        let us = Destination::new("US");
        let lines = [PriceLine::new(dec!(110), 1)];

        let free = calc.calculate(&lines, Some(&us), Discount::None).unwrap();
        assert_eq!(free.shipping_fee, Decimal::ZERO);

        let charged = calc
            .calculate(&lines, Some(&us), Discount::Fixed(dec!(20)))
            .unwrap();
        assert_eq!(charged.shipping_fee, dec!(5));
    }

    #[test]
    fn discount_is_taxed_after_and_clamped() {
        let lines = [PriceLine::new(dec!(50), 1)];
        let pct = calculator()
            .calculate(&lines, None, Discount::Percentage(dec!(10)))
            .unwrap();
        assert_eq!(pct.discount, dec!(5));
        assert_eq!(pct.tax, dec!(4.95));
        assert_eq!(pct.total, dec!(49.95));

        let clamped = calculator()
            .calculate(&lines, None, Discount::Fixed(dec!(75)))
            .unwrap();
        assert_eq!(clamped.discount, dec!(50));
        assert_eq!(clamped.total, Decimal::ZERO);
    }

    #[test]
    fn rejects_bad_input() {
        assert_matches!(
            calculator().calculate(&[PriceLine::new(dec!(1), 0)], None, Discount::None),
            Err(ServiceError::InvalidInput(_))
        );
        assert_matches!(
            calculator().calculate(&[PriceLine::new(dec!(-1), 1)], None, Discount::None),
            Err(ServiceError::InvalidInput(_))
        );
        assert_matches!(
            calculator().calculate(
                &[PriceLine::new(dec!(1), 1)],
                None,
                Discount::Percentage(dec!(120))
            ),
            Err(ServiceError::InvalidInput(_))
        );
    }

    #[test]
    fn rounding_is_half_away_from_zero() {
        assert_eq!(round_money(dec!(0.125)), dec!(0.13));
        assert_eq!(round_money(dec!(0.124)), dec!(0.12));
    }

    fn arb_line() -> impl Strategy<Value = PriceLine> {
        (0i64..10_000_000, 1i32..50)
            .prop_map(|(cents, qty)| PriceLine::new(Decimal::new(cents, 2), qty))
    }

    proptest! {
        #[test]
        fn total_always_matches_components(
            lines in prop::collection::vec(arb_line(), 1..8),
            discount_cents in 0i64..5_000_000,
            domestic in any::<bool>(),
        ) {
            let destination = Destination::new(if domestic { "US" } else { "FR" });
            let pricing = calculator()
                .calculate(&lines, Some(&destination), Discount::Fixed(Decimal::new(discount_cents, 2)))
                .unwrap();

            prop_assert!(pricing.is_consistent_with(lines.iter().map(PriceLine::subtotal)));
            prop_assert!(pricing.discount <= pricing.subtotal);
            prop_assert!(!pricing.total.is_sign_negative());
            prop_assert_eq!(pricing.total.round_dp(2), pricing.total);
        }

        #[test]
        fn calculation_is_deterministic(lines in prop::collection::vec(arb_line(), 1..5)) {
            let a = calculator().calculate(&lines, None, Discount::None).unwrap();
            let b = calculator().calculate(&lines, None, Discount::None).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
