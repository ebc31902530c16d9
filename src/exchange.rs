//! # Exchange Definitions
//!
//! Types for defining the exchanges the retry topology creates. Only the
//! standard broker exchange kinds are modelled; the topology is deliberately
//! plugin-free, so there is no delayed-message kind here.

/// The standard exchange kinds.
///
/// The retry topology declares two of them: a fanout exchange that spreads
/// rejected messages into the wait queue, and a headers exchange that routes
/// expired messages towards the dead-letter queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// Definition of an exchange, built with the builder pattern.
#[derive(Debug, Clone)]
pub struct ExchangeDefinition<'ex> {
    name: &'ex str,
    kind: ExchangeKind,
    durable: bool,
    auto_delete: bool,
}

impl<'ex> ExchangeDefinition<'ex> {
    /// Creates a new definition: a non-durable direct exchange by default.
    pub fn new(name: &'ex str) -> ExchangeDefinition<'ex> {
        ExchangeDefinition {
            name,
            kind: ExchangeKind::Direct,
            durable: false,
            auto_delete: false,
        }
    }

    /// Sets the exchange kind.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the kind to fanout.
    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    /// Sets the kind to headers.
    pub fn headers(mut self) -> Self {
        self.kind = ExchangeKind::Headers;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub(crate) fn get_kind(&self) -> ExchangeKind {
        self.kind
    }

    pub(crate) fn is_durable(&self) -> bool {
        self.durable
    }

    pub(crate) fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_onto_lapin() {
        assert!(matches!(
            lapin::ExchangeKind::from(ExchangeKind::Fanout),
            lapin::ExchangeKind::Fanout
        ));
        assert!(matches!(
            lapin::ExchangeKind::from(ExchangeKind::Headers),
            lapin::ExchangeKind::Headers
        ));
    }

    #[test]
    fn builder_starts_plain_and_accumulates() {
        let def = ExchangeDefinition::new("orders.wait.exchange").fanout().durable();

        assert_eq!(def.name(), "orders.wait.exchange");
        assert_eq!(def.get_kind(), ExchangeKind::Fanout);
        assert!(def.is_durable());
        assert!(!def.is_auto_delete());
    }
}
