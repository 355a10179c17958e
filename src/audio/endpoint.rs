//! Volume capability on one audio render endpoint

use alsa::mixer::{Mixer, Selem, SelemChannelId, SelemId};
use tracing::debug;

use crate::error::{AppError, Result};

/// Scalar volume get/set on one render endpoint.
///
/// Levels are normalized to `[0.0, 1.0]`; setting the same value twice is
/// safe. The production implementation is [`AlsaEndpoint`]; tests drive the
/// control loop with recording fakes.
pub trait VolumeSink {
    /// Display name of the endpoint behind this sink
    fn name(&self) -> &str;

    /// Current master volume as a scalar in `[0.0, 1.0]`
    fn get_scalar(&self) -> Result<f64>;

    /// Set the master volume; the level is clamped to `[0.0, 1.0]`
    fn set_scalar(&mut self, level: f64) -> Result<()>;
}

/// Volume control over one ALSA card's playback simple element.
///
/// Holds the mixer handle for the card plus the element id; scalar levels
/// map linearly onto the element's raw playback volume range.
pub struct AlsaEndpoint {
    name: String,
    mixer: Mixer,
    selem_id: SelemId,
}

impl AlsaEndpoint {
    /// Open the mixer for `card_index` and bind to the named element.
    pub fn open(card_index: i32, selem_name: &str, selem_index: u32, name: String) -> Result<Self> {
        let mixer_name = format!("hw:{}", card_index);
        let mixer = Mixer::new(&mixer_name, false)?;
        let selem_id = SelemId::new(selem_name, selem_index);

        if mixer.find_selem(&selem_id).is_none() {
            return Err(AppError::Endpoint {
                endpoint: name,
                reason: format!("mixer control '{}' not found on {}", selem_name, mixer_name),
            });
        }

        debug!("Endpoint activated: {} ({})", name, mixer_name);
        Ok(Self {
            name,
            mixer,
            selem_id,
        })
    }

    fn selem(&self) -> Result<Selem<'_>> {
        self.mixer
            .find_selem(&self.selem_id)
            .ok_or_else(|| AppError::Endpoint {
                endpoint: self.name.clone(),
                reason: "mixer control disappeared".to_string(),
            })
    }

    fn endpoint_error(&self, reason: String) -> AppError {
        AppError::Endpoint {
            endpoint: self.name.clone(),
            reason,
        }
    }
}

impl VolumeSink for AlsaEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_scalar(&self) -> Result<f64> {
        // Pick up volume changes made by other mixer clients since the last call
        let _ = self.mixer.handle_events();

        let selem = self.selem()?;
        let (min, max) = selem.get_playback_volume_range();
        let raw = selem
            .get_playback_volume(SelemChannelId::FrontLeft)
            .map_err(|e| self.endpoint_error(format!("failed to read volume: {}", e)))?;

        if max <= min {
            return Ok(0.0);
        }
        Ok(((raw - min) as f64 / (max - min) as f64).clamp(0.0, 1.0))
    }

    fn set_scalar(&mut self, level: f64) -> Result<()> {
        let level = level.clamp(0.0, 1.0);
        let selem = self.selem()?;
        let (min, max) = selem.get_playback_volume_range();
        let raw = min + (level * (max - min) as f64).round() as i64;

        selem
            .set_playback_volume_all(raw.clamp(min, max))
            .map_err(|e| self.endpoint_error(format!("failed to set volume: {}", e)))
    }
}
