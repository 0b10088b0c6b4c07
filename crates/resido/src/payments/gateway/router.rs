use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::payments::domain::TransactionMethod;

use super::{CardAchGateway, DeadlineGateway, GatewayError, NullGateway, PaymentGateway, TerminalGateway};

/// Picks the adapter that owns a payment method.
#[derive(Clone)]
pub struct GatewayRouter {
    card_ach: Arc<dyn PaymentGateway>,
    terminal: Arc<dyn PaymentGateway>,
    fallback: Arc<dyn PaymentGateway>,
}

impl GatewayRouter {
    /// Terminal payments settle through the card/ACH processor.
    pub fn new(card_ach: Arc<dyn PaymentGateway>) -> Self {
        let terminal: Arc<dyn PaymentGateway> = Arc::new(TerminalGateway::new(card_ach.clone()));
        Self {
            card_ach,
            terminal,
            fallback: Arc::new(NullGateway::new("offline payment methods")),
        }
    }

    /// Builds the production router. Without a configured processor every
    /// gateway-backed method fails with `gateway_not_configured`.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let card_ach: Arc<dyn PaymentGateway> = match CardAchGateway::from_config(config)? {
            Some(gateway) => Arc::new(DeadlineGateway::new(Arc::new(gateway), config.timeout)),
            None => {
                tracing::warn!("no card/ACH gateway configured");
                Arc::new(NullGateway::new("card and ACH payments"))
            }
        };
        Ok(Self::new(card_ach))
    }

    pub fn for_method(&self, method: TransactionMethod) -> Arc<dyn PaymentGateway> {
        match method {
            TransactionMethod::OnlineCard | TransactionMethod::OnlineAch => self.card_ach.clone(),
            TransactionMethod::PosTerminal => self.terminal.clone(),
            _ => self.fallback.clone(),
        }
    }
}
