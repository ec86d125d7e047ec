use crate::domain::settlement::CommissionPayoutLineItem;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

const HEADER: [&str; 11] = [
    "id",
    "batch",
    "recipient",
    "role",
    "amount",
    "state",
    "attempts",
    "transfer_reference",
    "failure_reason",
    "retry_after",
    "updated_at",
];

/// Flat CSV row for the operator settlement dashboard.
#[derive(Debug, Serialize)]
struct LineItemRow<'a> {
    id: String,
    batch: String,
    recipient: &'a str,
    role: String,
    amount: String,
    state: String,
    attempts: u32,
    transfer_reference: Option<&'a str>,
    failure_reason: Option<&'a str>,
    retry_after: Option<String>,
    updated_at: String,
}

impl<'a> From<&'a CommissionPayoutLineItem> for LineItemRow<'a> {
    fn from(item: &'a CommissionPayoutLineItem) -> Self {
        Self {
            id: item.id.to_string(),
            batch: item.batch.to_string(),
            recipient: item.recipient.as_str(),
            role: item.role.to_string(),
            amount: item.amount.to_string(),
            state: item.state.to_string(),
            attempts: item.attempts,
            transfer_reference: item.transfer_reference.as_deref(),
            failure_reason: item.failure_reason.as_deref(),
            retry_after: item.retry_after.map(|at| at.to_rfc3339()),
            updated_at: item.updated_at.to_rfc3339(),
        }
    }
}

/// Writes payout line items as CSV.
pub struct LineItemWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> LineItemWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(sink),
        }
    }

    /// Writes the header, then one row per item, and flushes. The header is
    /// written even when there are no items.
    pub fn write_line_items<'a, I>(&mut self, items: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a CommissionPayoutLineItem>,
    {
        self.writer.write_record(HEADER)?;
        for item in items {
            self.writer.serialize(LineItemRow::from(item))?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
