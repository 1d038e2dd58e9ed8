use serde::Deserialize;
use validator::Validate;

use crate::{
    error::AppError,
    services::{
        ledger::VoucherKind,
        schedule::{InstallmentFrequency, PaymentType},
    },
};

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::UnprocessableEntity(format!("Validation failed: {errors}")))
}

pub fn clamp_limit(limit: i64) -> i64 {
    limit.clamp(1, 500)
}

pub fn serialize_to_map<T>(value: &T) -> serde_json::Map<String, serde_json::Value>
where
    T: serde::Serialize,
{
    let json = serde_json::to_value(value)
        .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()));
    json.as_object().cloned().unwrap_or_default()
}

pub fn remove_nulls(
    mut map: serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    map.retain(|_, value| !value.is_null());
    map
}

fn default_limit_100() -> i64 {
    100
}
fn default_limit_200() -> i64 {
    200
}
fn default_true() -> bool {
    true
}
fn default_role_viewer() -> String {
    "viewer".to_string()
}
fn default_unit_status_available() -> String {
    "available".to_string()
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct IdPath {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UnitPartnerPath {
    pub id: String,
    pub partner_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ReportRangeQuery {
    pub from_date: Option<String>,
    pub to_date: Option<String>,
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateUserInput {
    /// Subject id issued by the identity provider.
    pub id: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1, max = 255))]
    pub full_name: String,
    #[serde(default = "default_role_viewer")]
    pub role: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct UpdateUserInput {
    #[validate(length(min = 1, max = 255))]
    pub full_name: Option<String>,
    pub role: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UsersQuery {
    pub role: Option<String>,
    pub is_active: Option<bool>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

// ---------------------------------------------------------------------------
// Customers, partners, brokers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateCustomerInput {
    #[validate(length(min = 1, max = 255))]
    pub full_name: String,
    #[validate(length(max = 64))]
    pub phone: Option<String>,
    #[validate(length(min = 1, max = 64))]
    pub national_id: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
    pub address: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct UpdateCustomerInput {
    #[validate(length(min = 1, max = 255))]
    pub full_name: Option<String>,
    #[validate(length(max = 64))]
    pub phone: Option<String>,
    #[validate(length(min = 1, max = 64))]
    pub national_id: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
    pub address: Option<String>,
    pub notes: Option<String>,
}

/// Shared by the customer, partner and broker listings.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct NameSearchQuery {
    pub q: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreatePartyInput {
    #[validate(length(min = 1, max = 255))]
    pub full_name: String,
    #[validate(length(max = 64))]
    pub phone: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct UpdatePartyInput {
    #[validate(length(min = 1, max = 255))]
    pub full_name: Option<String>,
    #[validate(length(max = 64))]
    pub phone: Option<String>,
    pub notes: Option<String>,
}

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateUnitInput {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    pub name: Option<String>,
    pub unit_type: Option<String>,
    pub building: Option<String>,
    pub floor: Option<i32>,
    #[validate(range(exclusive_min = 0.0))]
    pub area_sqm: Option<f64>,
    #[serde(default)]
    #[validate(range(min = 0.0, max = 999999999999.99))]
    pub list_price: f64,
    #[serde(default = "default_unit_status_available")]
    pub status: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct UpdateUnitInput {
    #[validate(length(min = 1, max = 64))]
    pub code: Option<String>,
    pub name: Option<String>,
    pub unit_type: Option<String>,
    pub building: Option<String>,
    pub floor: Option<i32>,
    #[validate(range(exclusive_min = 0.0))]
    pub area_sqm: Option<f64>,
    #[validate(range(min = 0.0, max = 999999999999.99))]
    pub list_price: Option<f64>,
    pub status: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UnitsQuery {
    pub status: Option<String>,
    pub unit_type: Option<String>,
    pub building: Option<String>,
    pub q: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct UnitPartnerInput {
    pub partner_id: String,
    #[validate(range(exclusive_min = 0.0, max = 100.0))]
    pub share_percent: f64,
}

// ---------------------------------------------------------------------------
// Contracts and installments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateContractInput {
    #[validate(length(min = 1, max = 64))]
    pub code: Option<String>,
    pub unit_id: String,
    pub customer_id: String,
    pub broker_id: Option<String>,
    /// Defaults to today in the business timezone.
    pub contract_date: Option<String>,
    #[validate(range(exclusive_min = 0.0, max = 999999999999.99))]
    pub total_price: f64,
    #[serde(default)]
    #[validate(range(min = 0.0, max = 999999999999.99))]
    pub discount_amount: f64,
    #[serde(default)]
    #[validate(range(min = 0.0, max = 999999999999.99))]
    pub down_payment: f64,
    #[serde(default)]
    #[validate(range(min = 0.0, max = 999999999999.99))]
    pub maintenance_deposit: f64,
    #[serde(default)]
    pub payment_type: PaymentType,
    #[serde(default)]
    pub installment_frequency: InstallmentFrequency,
    #[serde(default)]
    pub installment_count: u32,
    #[serde(default)]
    pub annual_payment_count: u32,
    #[serde(default)]
    #[validate(range(min = 0.0, max = 999999999999.99))]
    pub annual_payment_amount: f64,
    #[serde(default)]
    #[validate(range(min = 0.0, max = 100.0))]
    pub broker_percent: f64,
    #[serde(default)]
    #[validate(range(min = 0.0, max = 999999999999.99))]
    pub broker_amount: f64,
    /// Safe that receives the down payment.
    pub safe_id: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct UpdateContractInput {
    #[validate(length(min = 1, max = 64))]
    pub code: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, serde::Serialize)]
pub struct CancelContractInput {
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ContractsQuery {
    pub customer_id: Option<String>,
    pub unit_id: Option<String>,
    pub broker_id: Option<String>,
    pub status: Option<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct InstallmentsQuery {
    pub contract_id: Option<String>,
    pub unit_id: Option<String>,
    pub status: Option<String>,
    pub due_from: Option<String>,
    pub due_to: Option<String>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct UpdateInstallmentInput {
    #[validate(range(exclusive_min = 0.0, max = 999999999999.99))]
    pub amount: Option<f64>,
    pub due_date: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct PayInstallmentInput {
    /// Defaults to the remaining balance.
    #[validate(range(exclusive_min = 0.0, max = 999999999999.99))]
    pub amount: Option<f64>,
    pub safe_id: String,
    pub paid_at: Option<String>,
    pub notes: Option<String>,
}

// ---------------------------------------------------------------------------
// Safes, vouchers, broker dues
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateSafeInput {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[serde(default)]
    #[validate(range(min = 0.0, max = 999999999999.99))]
    pub balance: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct UpdateSafeInput {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct SafesQuery {
    pub is_active: Option<bool>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct SafeTransferInput {
    pub from_safe_id: String,
    pub to_safe_id: String,
    #[validate(range(exclusive_min = 0.0, max = 999999999999.99))]
    pub amount: f64,
    pub transfer_date: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct SafeTransfersQuery {
    pub safe_id: Option<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateVoucherInput {
    pub kind: VoucherKind,
    pub safe_id: String,
    #[validate(range(exclusive_min = 0.0, max = 999999999999.99))]
    pub amount: f64,
    pub voucher_date: Option<String>,
    #[validate(length(max = 1000))]
    pub description: Option<String>,
    #[validate(length(max = 255))]
    pub party_name: Option<String>,
    pub contract_id: Option<String>,
    pub unit_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct VouchersQuery {
    pub kind: Option<String>,
    pub safe_id: Option<String>,
    pub contract_id: Option<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct BrokerDuesQuery {
    pub broker_id: Option<String>,
    pub contract_id: Option<String>,
    pub status: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PayBrokerDueInput {
    pub safe_id: String,
    pub paid_at: Option<String>,
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct AuditLogsQuery {
    pub entity_name: Option<String>,
    pub entity_id: Option<String>,
    pub actor_user_id: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        remove_nulls, serialize_to_map, validate_input, CreateContractInput, CreateCustomerInput,
        UnitPartnerInput,
    };
    use crate::services::schedule::{InstallmentFrequency, PaymentType};

    #[test]
    fn contract_input_applies_defaults() {
        let input: CreateContractInput = serde_json::from_value(json!({
            "unit_id": "u",
            "customer_id": "c",
            "total_price": 1000000.0,
            "installment_count": 24
        }))
        .expect("valid payload");
        assert_eq!(input.payment_type, PaymentType::Installments);
        assert_eq!(input.installment_frequency, InstallmentFrequency::Monthly);
        assert_eq!(input.discount_amount, 0.0);
        assert!(validate_input(&input).is_ok());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let input = UnitPartnerInput {
            partner_id: "p".to_string(),
            share_percent: 120.0,
        };
        assert!(validate_input(&input).is_err());

        let customer: CreateCustomerInput = serde_json::from_value(json!({
            "full_name": "Mona Adel",
            "email": "not-an-email"
        }))
        .expect("valid payload");
        assert!(validate_input(&customer).is_err());
    }

    #[test]
    fn rejects_amounts_beyond_column_precision() {
        let input: CreateContractInput = serde_json::from_value(json!({
            "unit_id": "u",
            "customer_id": "c",
            "total_price": 1000.0,
            "down_payment": 1e18,
            "installment_count": 12
        }))
        .expect("valid payload");
        assert!(validate_input(&input).is_err());
    }

    #[test]
    fn strips_absent_fields_from_patch_maps() {
        let customer: CreateCustomerInput = serde_json::from_value(json!({
            "full_name": "Mona Adel",
            "phone": "+20 100 000 0000"
        }))
        .expect("valid payload");
        let map = remove_nulls(serialize_to_map(&customer));
        assert_eq!(map.len(), 2);
        assert!(map.get("email").is_none());
    }
}
