pub mod event;
pub mod order;
pub mod referral;
pub mod ticket;
pub mod user;

pub use event::{Event, TicketType, Tier, TierAllocation};
pub use order::{
    Order, OrderLine, PaymentMethod, PaymentStatus, PricedLine, Reservation, ReservationState,
};
pub use referral::Referral;
pub use ticket::{
    OwnershipRecord, Ticket, TicketStatus, TicketSummary, TicketView, TransferChannel,
};
pub use user::User;
