//! Logistics and payment KPIs per organization.

use keystone_core::{
    days_between, ConflictFilter, ConflictState, ConflictType, Invoice, InvoiceStatus,
    KeystoneResult, OrganizationId, Shipment, Timestamp,
};
use keystone_storage::Storage;
use serde::Serialize;

/// Shipment delivery performance for one organization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogisticsKpis {
    pub organization_id: OrganizationId,
    pub total_shipments: u64,
    pub in_transit: u64,
    pub delivered: u64,
    pub delivered_on_time: u64,
    /// Delivered late, or in transit with an active exception
    pub delayed: u64,
    /// Share of delivered shipments that arrived on time; 100 when none delivered
    pub on_time_rate: f64,
    /// Mean days late across late deliveries; 0 when none were late
    pub average_delay_days: f64,
    pub active_delay_conflicts: u64,
    pub computed_at: Timestamp,
}

/// Days a delivered shipment arrived after its target date (ETA, else ROS).
///
/// `None` when the shipment is undelivered or has no target date.
fn delivery_lateness(shipment: &Shipment) -> Option<i64> {
    let delivered = shipment.actual_delivery_date?;
    let target = shipment.logistics_eta.or(shipment.ros_date)?;
    Some(days_between(target, delivered))
}

pub async fn logistics_kpis<S: Storage + ?Sized>(
    store: &S,
    organization_id: OrganizationId,
    now: Timestamp,
) -> KeystoneResult<LogisticsKpis> {
    let shipments = store.shipment_list_by_organization(organization_id).await?;
    let purchase_orders = store
        .purchase_order_list_by_organization(organization_id)
        .await?;

    let mut kpis = LogisticsKpis {
        organization_id,
        total_shipments: shipments.len() as u64,
        in_transit: 0,
        delivered: 0,
        delivered_on_time: 0,
        delayed: 0,
        on_time_rate: 100.0,
        average_delay_days: 0.0,
        active_delay_conflicts: 0,
        computed_at: now,
    };

    let mut late_days: Vec<i64> = Vec::new();
    for shipment in &shipments {
        if shipment.status.is_in_transit() {
            kpis.in_transit += 1;
            if shipment.is_exception {
                kpis.delayed += 1;
            }
        }
        if !shipment.status.is_delivered() {
            continue;
        }
        kpis.delivered += 1;
        match delivery_lateness(shipment) {
            Some(days) if days > 0 => {
                kpis.delayed += 1;
                late_days.push(days);
            }
            // No target date counts as on time
            _ => kpis.delivered_on_time += 1,
        }
    }

    if kpis.delivered > 0 {
        kpis.on_time_rate = kpis.delivered_on_time as f64 / kpis.delivered as f64 * 100.0;
    }
    if !late_days.is_empty() {
        kpis.average_delay_days = late_days.iter().sum::<i64>() as f64 / late_days.len() as f64;
    }

    if !purchase_orders.is_empty() {
        let filter = ConflictFilter::new()
            .with_states(ConflictState::ACTIVE)
            .with_types([ConflictType::Delay])
            .with_purchase_orders(purchase_orders.iter().map(|po| po.purchase_order_id));
        kpis.active_delay_conflicts = store.conflict_list(&filter).await?.len() as u64;
    }

    tracing::debug!(
        organization_id = %organization_id,
        total = kpis.total_shipments,
        on_time_rate = kpis.on_time_rate,
        "Logistics KPIs computed"
    );
    Ok(kpis)
}

/// Invoice backlog and payment speed for one organization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentKpis {
    pub organization_id: OrganizationId,
    /// Awaiting approval or approved but not yet payable
    pub pending_invoices: u64,
    pub overdue_invoices: u64,
    pub overdue_amount: f64,
    /// Mean days from submission to payment across paid invoices; 0 when none paid
    pub average_payment_days: f64,
    pub computed_at: Timestamp,
}

/// Unpaid past its due date. Rejected and draft invoices are never owed.
fn is_overdue(invoice: &Invoice, now: Timestamp) -> bool {
    !matches!(
        invoice.status,
        InvoiceStatus::Paid | InvoiceStatus::Rejected | InvoiceStatus::Draft
    ) && invoice.due_date < now.date_naive()
}

fn payment_days(invoice: &Invoice) -> Option<f64> {
    if invoice.status != InvoiceStatus::Paid {
        return None;
    }
    let paid_at = invoice.paid_at?;
    Some((paid_at - invoice.submitted_at).num_seconds() as f64 / 86_400.0)
}

pub async fn payment_kpis<S: Storage + ?Sized>(
    store: &S,
    organization_id: OrganizationId,
    now: Timestamp,
) -> KeystoneResult<PaymentKpis> {
    let invoices = store.invoice_list_by_organization(organization_id).await?;

    let mut kpis = PaymentKpis {
        organization_id,
        pending_invoices: 0,
        overdue_invoices: 0,
        overdue_amount: 0.0,
        average_payment_days: 0.0,
        computed_at: now,
    };

    let mut cycles: Vec<f64> = Vec::new();
    for invoice in &invoices {
        if matches!(
            invoice.status,
            InvoiceStatus::PendingApproval | InvoiceStatus::Approved
        ) {
            kpis.pending_invoices += 1;
        }
        if is_overdue(invoice, now) {
            kpis.overdue_invoices += 1;
            kpis.overdue_amount += invoice.amount;
        }
        cycles.extend(payment_days(invoice));
    }
    if !cycles.is_empty() {
        kpis.average_payment_days = cycles.iter().sum::<f64>() / cycles.len() as f64;
    }

    tracing::debug!(
        organization_id = %organization_id,
        invoices = invoices.len(),
        overdue = kpis.overdue_invoices,
        "Payment KPIs computed"
    );
    Ok(kpis)
}
