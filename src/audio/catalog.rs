//! Audio render endpoint enumeration
//!
//! Walks the ALSA cards and collects every playback simple element with a
//! volume control as an addressable endpoint. The catalog is index-stable
//! for the session: the operator picks an endpoint by the listed index and
//! the session activates it once, before the serial device is opened.

use alsa::mixer::{Mixer, Selem};
use tracing::{debug, info};

use super::endpoint::{AlsaEndpoint, VolumeSink};
use crate::error::{AppError, Result};

/// One enumerated render endpoint
#[derive(Debug, Clone)]
pub struct EndpointInfo {
    /// Mixer control name (e.g. "Master")
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// ALSA card index
    pub card_index: i32,
    /// Mixer control index on the card
    pub selem_index: u32,
}

/// Endpoint listing and activation consumed by the control session
pub trait EndpointCatalog {
    /// Enumerated endpoints, index-stable for the session
    fn list(&self) -> &[EndpointInfo];

    /// Activate the endpoint at `index`, yielding its volume capability
    fn activate(&self, index: usize) -> Result<Box<dyn VolumeSink>>;
}

/// Catalog of ALSA playback endpoints
pub struct AlsaCatalog {
    endpoints: Vec<EndpointInfo>,
}

impl AlsaCatalog {
    /// Enumerate all cards and their playback-volume mixer controls.
    pub fn discover() -> Result<Self> {
        let mut endpoints = Vec::new();

        for card_result in alsa::card::Iter::new() {
            let card = match card_result {
                Ok(c) => c,
                Err(e) => {
                    debug!("Error iterating card: {}", e);
                    continue;
                }
            };

            let card_index = card.get_index();
            let card_name = card.get_name().unwrap_or_else(|_| "Unknown".to_string());

            let mixer = match Mixer::new(&format!("hw:{}", card_index), false) {
                Ok(m) => m,
                Err(e) => {
                    debug!("Card {} has no usable mixer: {}", card_index, e);
                    continue;
                }
            };

            for elem in mixer.iter() {
                let selem = match Selem::new(elem) {
                    Some(s) => s,
                    None => continue,
                };
                if !selem.has_playback_volume() {
                    continue;
                }

                let id = selem.get_id();
                let name = id.get_name().unwrap_or("unknown").to_string();
                debug!("Found playback control '{}' on card {}", name, card_index);
                endpoints.push(EndpointInfo {
                    description: format!("{} - {}", card_name, name),
                    name,
                    card_index,
                    selem_index: id.get_index(),
                });
            }
        }

        info!("Found {} audio render endpoints", endpoints.len());
        Ok(Self { endpoints })
    }
}

impl EndpointCatalog for AlsaCatalog {
    fn list(&self) -> &[EndpointInfo] {
        &self.endpoints
    }

    fn activate(&self, index: usize) -> Result<Box<dyn VolumeSink>> {
        let info = self
            .endpoints
            .get(index)
            .ok_or(AppError::InvalidSelection {
                index,
                count: self.endpoints.len(),
            })?;

        let sink = AlsaEndpoint::open(
            info.card_index,
            &info.name,
            info.selem_index,
            info.description.clone(),
        )?;
        Ok(Box::new(sink))
    }
}
