// ============================================================================
// Domain Layer - Business Logic
// ============================================================================
//
// - order/   - the Order aggregate, its line items, statuses and service
// - refund/  - refund creation and full-refund settlement
// - catalog  - products, coupons and download permissions the effects touch
//
// Storage lives behind the traits in src/store/.
//
// ============================================================================

pub mod order;
pub mod refund;
pub mod catalog;
