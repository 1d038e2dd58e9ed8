//! Installment schedule generation for new contracts.

use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub const MAX_INSTALLMENTS: u32 = 600;
pub const MAX_ANNUAL_PAYMENTS: u32 = 50;
/// Largest money value a `numeric(14,2)` column holds.
pub const MAX_AMOUNT: f64 = 999_999_999_999.99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    Cash,
    #[default]
    Installments,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallmentFrequency {
    #[default]
    Monthly,
    Quarterly,
    SemiAnnual,
    Annual,
}

impl InstallmentFrequency {
    pub fn months(self) -> u32 {
        match self {
            Self::Monthly => 1,
            Self::Quarterly => 3,
            Self::SemiAnnual => 6,
            Self::Annual => 12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallmentKind {
    Regular,
    Annual,
    Maintenance,
}

impl InstallmentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Annual => "annual",
            Self::Maintenance => "maintenance",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleInput {
    pub contract_date: NaiveDate,
    pub payment_type: PaymentType,
    pub net_price: f64,
    pub down_payment: f64,
    pub installment_count: u32,
    pub frequency: InstallmentFrequency,
    pub annual_payment_count: u32,
    pub annual_payment_amount: f64,
    pub maintenance_deposit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledInstallment {
    pub sequence: u32,
    pub kind: InstallmentKind,
    pub amount: f64,
    pub due_date: NaiveDate,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ScheduleError {
    #[error("net price must be greater than zero")]
    NonPositivePrice,
    #[error("{0} cannot be negative")]
    Negative(&'static str),
    #[error("{0} exceeds the largest supported amount")]
    TooLarge(&'static str),
    #[error("down payment and annual payments exceed the net price")]
    OverAllocated,
    #[error("installment_count must be between 1 and {} when a balance remains", MAX_INSTALLMENTS)]
    InvalidCount,
    #[error("annual_payment_count cannot exceed {}", MAX_ANNUAL_PAYMENTS)]
    TooManyAnnualPayments,
    #[error("due date falls outside the supported calendar range")]
    DateOverflow,
}

impl From<ScheduleError> for AppError {
    fn from(error: ScheduleError) -> Self {
        AppError::UnprocessableEntity(format!("Invalid payment plan: {error}."))
    }
}

/// Amount left to finance through regular installments.
pub fn financed_amount(input: &ScheduleInput) -> Result<f64, ScheduleError> {
    financed_cents(input).map(from_cents)
}

fn financed_cents(input: &ScheduleInput) -> Result<i64, ScheduleError> {
    let annual_cents = match input.payment_type {
        PaymentType::Cash => 0,
        PaymentType::Installments => to_cents(input.annual_payment_amount)
            .checked_mul(i64::from(input.annual_payment_count))
            .ok_or(ScheduleError::OverAllocated)?,
    };
    to_cents(input.net_price)
        .checked_sub(to_cents(input.down_payment))
        .and_then(|rest| rest.checked_sub(annual_cents))
        .ok_or(ScheduleError::OverAllocated)
}

/// Build the full payment schedule for a contract.
///
/// Regular installments split the financed amount evenly in cents; the final
/// one carries the rounding remainder so the schedule sums exactly.
pub fn generate_schedule(input: &ScheduleInput) -> Result<Vec<ScheduledInstallment>, ScheduleError> {
    validate(input)?;

    let financed_cents = financed_cents(input)?;
    let mut items: Vec<(InstallmentKind, i64, NaiveDate)> = Vec::new();

    match input.payment_type {
        PaymentType::Cash => {
            if financed_cents > 0 {
                items.push((InstallmentKind::Regular, financed_cents, input.contract_date));
            }
        }
        PaymentType::Installments => {
            if financed_cents > 0 {
                let count = i64::from(input.installment_count);
                let base = financed_cents / count;
                let remainder = financed_cents - base * count;
                let step = input.frequency.months();
                for index in 1..=input.installment_count {
                    let amount = if index == input.installment_count {
                        base + remainder
                    } else {
                        base
                    };
                    let due = add_months(input.contract_date, step * index)?;
                    items.push((InstallmentKind::Regular, amount, due));
                }
            }

            let annual_cents = to_cents(input.annual_payment_amount);
            if annual_cents > 0 {
                for index in 1..=input.annual_payment_count {
                    let due = add_months(input.contract_date, 12 * index)?;
                    items.push((InstallmentKind::Annual, annual_cents, due));
                }
            }
        }
    }

    let maintenance_cents = to_cents(input.maintenance_deposit);
    if maintenance_cents > 0 {
        let due = items
            .iter()
            .filter(|(kind, _, _)| *kind == InstallmentKind::Regular)
            .map(|(_, _, due)| *due)
            .max()
            .unwrap_or(input.contract_date);
        items.push((InstallmentKind::Maintenance, maintenance_cents, due));
    }

    items.sort_by(|left, right| left.2.cmp(&right.2).then(left.0.cmp(&right.0)));

    Ok(items
        .into_iter()
        .enumerate()
        .map(|(index, (kind, cents, due_date))| ScheduledInstallment {
            sequence: index as u32 + 1,
            kind,
            amount: from_cents(cents),
            due_date,
        })
        .collect())
}

fn validate(input: &ScheduleInput) -> Result<(), ScheduleError> {
    if to_cents(input.net_price) <= 0 {
        return Err(ScheduleError::NonPositivePrice);
    }
    for (name, value) in [
        ("net_price", input.net_price),
        ("down_payment", input.down_payment),
        ("annual_payment_amount", input.annual_payment_amount),
        ("maintenance_deposit", input.maintenance_deposit),
    ] {
        if !value.is_finite() || value > MAX_AMOUNT {
            return Err(ScheduleError::TooLarge(name));
        }
        if to_cents(value) < 0 {
            return Err(ScheduleError::Negative(name));
        }
    }
    if input.annual_payment_count > MAX_ANNUAL_PAYMENTS {
        return Err(ScheduleError::TooManyAnnualPayments);
    }

    let financed_cents = financed_cents(input)?;
    if financed_cents < 0 {
        return Err(ScheduleError::OverAllocated);
    }
    if input.payment_type == PaymentType::Installments
        && financed_cents > 0
        && !(1..=MAX_INSTALLMENTS).contains(&input.installment_count)
    {
        return Err(ScheduleError::InvalidCount);
    }
    Ok(())
}

/// Calendar month arithmetic; day-of-month clamps to the target month's end.
pub fn add_months(date: NaiveDate, months: u32) -> Result<NaiveDate, ScheduleError> {
    date.checked_add_months(Months::new(months))
        .ok_or(ScheduleError::DateOverflow)
}

fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

fn from_cents(cents: i64) -> f64 {
    cents as f64 / 100.0
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{
        add_months, financed_amount, generate_schedule, InstallmentFrequency, InstallmentKind,
        PaymentType, ScheduleError, ScheduleInput,
    };

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("valid date")
    }

    fn plan(net_price: f64, down_payment: f64, count: u32) -> ScheduleInput {
        ScheduleInput {
            contract_date: date("2026-01-31"),
            payment_type: PaymentType::Installments,
            net_price,
            down_payment,
            installment_count: count,
            frequency: InstallmentFrequency::Monthly,
            annual_payment_count: 0,
            annual_payment_amount: 0.0,
            maintenance_deposit: 0.0,
        }
    }

    fn total(schedule: &[super::ScheduledInstallment]) -> f64 {
        (schedule.iter().map(|item| item.amount).sum::<f64>() * 100.0).round() / 100.0
    }

    #[test]
    fn splits_financed_amount_and_puts_remainder_last() {
        let schedule = generate_schedule(&plan(1_000.0, 0.0, 3)).expect("schedule");
        let amounts = schedule.iter().map(|item| item.amount).collect::<Vec<_>>();
        assert_eq!(amounts, vec![333.33, 333.33, 333.34]);
        assert_eq!(total(&schedule), 1_000.0);
    }

    #[test]
    fn clamps_due_dates_to_month_end() {
        let schedule = generate_schedule(&plan(300.0, 0.0, 3)).expect("schedule");
        let dues = schedule.iter().map(|item| item.due_date).collect::<Vec<_>>();
        assert_eq!(
            dues,
            vec![date("2026-02-28"), date("2026-03-31"), date("2026-04-30")]
        );
    }

    #[test]
    fn quarterly_plan_steps_three_months() {
        let mut input = plan(1_200_000.0, 200_000.0, 4);
        input.contract_date = date("2026-03-15");
        input.frequency = InstallmentFrequency::Quarterly;

        let schedule = generate_schedule(&input).expect("schedule");
        assert_eq!(schedule.len(), 4);
        assert!(schedule.iter().all(|item| item.amount == 250_000.0));
        assert_eq!(schedule[0].due_date, date("2026-06-15"));
        assert_eq!(schedule[3].due_date, date("2027-03-15"));
    }

    #[test]
    fn annual_payments_reduce_regular_installments() {
        let mut input = plan(100_000.0, 10_000.0, 24);
        input.contract_date = date("2026-01-01");
        input.annual_payment_count = 2;
        input.annual_payment_amount = 15_000.0;

        assert_eq!(financed_amount(&input), Ok(60_000.0));
        let schedule = generate_schedule(&input).expect("schedule");
        assert_eq!(schedule.len(), 26);
        assert_eq!(total(&schedule), 90_000.0);

        let annual = schedule
            .iter()
            .filter(|item| item.kind == InstallmentKind::Annual)
            .collect::<Vec<_>>();
        assert_eq!(annual.len(), 2);
        assert_eq!(annual[0].due_date, date("2027-01-01"));
        assert_eq!(annual[1].due_date, date("2028-01-01"));

        // Same-day regular installment sorts before the annual payment.
        let same_day = schedule
            .iter()
            .filter(|item| item.due_date == date("2027-01-01"))
            .map(|item| item.kind)
            .collect::<Vec<_>>();
        assert_eq!(same_day, vec![InstallmentKind::Regular, InstallmentKind::Annual]);

        let sequences = schedule.iter().map(|item| item.sequence).collect::<Vec<_>>();
        assert_eq!(sequences, (1..=26).collect::<Vec<_>>());
    }

    #[test]
    fn maintenance_deposit_is_due_with_last_installment() {
        let mut input = plan(12_000.0, 0.0, 12);
        input.maintenance_deposit = 800.0;

        let schedule = generate_schedule(&input).expect("schedule");
        let last = schedule.last().expect("non-empty");
        assert_eq!(last.kind, InstallmentKind::Maintenance);
        assert_eq!(last.amount, 800.0);
        assert_eq!(last.due_date, date("2027-01-31"));
    }

    #[test]
    fn cash_contract_is_one_installment_on_contract_date() {
        let mut input = plan(500_000.0, 100_000.0, 0);
        input.payment_type = PaymentType::Cash;
        input.annual_payment_count = 3;
        input.annual_payment_amount = 1_000.0;

        let schedule = generate_schedule(&input).expect("schedule");
        assert_eq!(schedule.len(), 1);
        assert_eq!(schedule[0].amount, 400_000.0);
        assert_eq!(schedule[0].due_date, date("2026-01-31"));
    }

    #[test]
    fn fully_paid_down_payment_produces_no_regular_installments() {
        let mut input = plan(50_000.0, 50_000.0, 0);
        input.maintenance_deposit = 1_000.0;
        let schedule = generate_schedule(&input).expect("schedule");
        assert_eq!(schedule.len(), 1);
        assert_eq!(schedule[0].kind, InstallmentKind::Maintenance);
        assert_eq!(schedule[0].due_date, date("2026-01-31"));
    }

    #[test]
    fn rejects_invalid_plans() {
        assert_eq!(
            generate_schedule(&plan(0.0, 0.0, 12)),
            Err(ScheduleError::NonPositivePrice)
        );
        assert_eq!(
            generate_schedule(&plan(1_000.0, 1_500.0, 12)),
            Err(ScheduleError::OverAllocated)
        );
        assert_eq!(
            generate_schedule(&plan(1_000.0, 0.0, 0)),
            Err(ScheduleError::InvalidCount)
        );
        assert_eq!(
            generate_schedule(&plan(1_000.0, -5.0, 10)),
            Err(ScheduleError::Negative("down_payment"))
        );
    }

    #[test]
    fn oversized_amounts_are_rejected_without_overflow() {
        let mut input = plan(1_000.0, 1e18, 12);
        input.annual_payment_count = 1;
        input.annual_payment_amount = 1e18;
        assert_eq!(
            generate_schedule(&input),
            Err(ScheduleError::TooLarge("down_payment"))
        );

        let mut input = plan(1_000.0, 0.0, 12);
        input.annual_payment_count = 50;
        input.annual_payment_amount = 999_999_999_999.0;
        assert_eq!(generate_schedule(&input), Err(ScheduleError::OverAllocated));
    }

    #[test]
    fn add_months_handles_leap_years() {
        assert_eq!(add_months(date("2028-01-31"), 1), Ok(date("2028-02-29")));
        assert_eq!(add_months(date("2026-11-30"), 3), Ok(date("2027-02-28")));
    }
}
