use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::expense::{CreateExpenseRequest, ExpenseCategory};
use crate::errors::DomainError;

const DEFAULT_OCR_CURRENCY: &str = "USD";

/// Best-effort fields extracted from a receipt image.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub merchant: Option<String>,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub receipt_url: Option<String>,
    #[serde(default)]
    pub raw_text: Option<String>,
}

impl CreateExpenseRequest {
    /// Pre-fills an expense from OCR output. Only the amount is mandatory.
    pub fn from_ocr(ocr: &OcrResult, now: DateTime<Utc>) -> Result<Self, DomainError> {
        let amount = ocr
            .amount
            .filter(|amount| *amount > Decimal::ZERO)
            .ok_or_else(|| DomainError::Validation("could not extract amount from receipt".to_string()))?;

        let currency = ocr
            .currency
            .as_deref()
            .map(str::trim)
            .filter(|currency| !currency.is_empty())
            .unwrap_or(DEFAULT_OCR_CURRENCY)
            .to_ascii_uppercase();

        let category =
            ocr.category.as_deref().map(ExpenseCategory::from_label).unwrap_or(ExpenseCategory::Other);
        let merchant = ocr.merchant.clone().filter(|merchant| !merchant.trim().is_empty());

        Ok(Self {
            amount,
            currency,
            category,
            description: format!(
                "Auto-extracted from receipt: {}",
                merchant.as_deref().unwrap_or("unknown merchant")
            ),
            expense_date: ocr.date.unwrap_or(now),
            receipt_url: ocr.receipt_url.clone(),
            merchant,
        })
    }
}
