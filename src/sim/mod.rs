//! In-memory media for exercising the adapters without hardware
//!
//! Each medium hands out driver handles that plug into the matching
//! transport, plus controls for power loss and send-failure injection.
mod espnow_air;
mod nrf24_air;
mod wifi_air;

pub use espnow_air::{EspNowAir, SimEspNowRadio};
pub use nrf24_air::{Nrf24Air, SimNrf24Radio};
pub use wifi_air::{SimWifiDevice, WifiAir};
