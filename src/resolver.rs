use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::cache::{CacheKey, CacheStore, CacheValue};
use crate::config::{AppConfig, TrackedCountries};
use crate::errors::AppResult;
use crate::geocoder::{AddressComponents, GeocodeError, GeocodeQuery, GeocodingService};
use crate::identity::{customer_id, ExtractedIdentity, LocationReference};
use crate::place::{FailureReason, ResolvedPlace, StateRef, UnresolvableReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    Cache,
    Api,
    /// Decided locally without consulting the provider.
    ShortCircuit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub source: ResolutionSource,
    pub outcome: Result<ResolvedPlace, FailureReason>,
}

impl Resolution {
    fn new(source: ResolutionSource, outcome: Result<ResolvedPlace, FailureReason>) -> Self {
        Self { source, outcome }
    }
}

/// Cache-first resolution of extracted identities into places.
///
/// The cache lock is never held across a provider call. Only successes and
/// terminal failures are written back; transient and provider failures are
/// retried on the next run.
pub struct Resolver {
    cache: Arc<Mutex<CacheStore>>,
    lookup: GeocodingService,
    rate_limiter: RateLimiter,
    tracked: TrackedCountries,
}

impl Resolver {
    pub fn new(cache: Arc<Mutex<CacheStore>>, lookup: GeocodingService, config: &AppConfig) -> Self {
        Self::with_interval(
            cache,
            lookup,
            Duration::from_millis(config.geocoder_min_interval_ms),
            config.tracked_countries.clone(),
        )
    }

    pub fn with_interval(
        cache: Arc<Mutex<CacheStore>>,
        lookup: GeocodingService,
        min_interval: Duration,
        tracked: TrackedCountries,
    ) -> Self {
        Self {
            cache,
            lookup,
            rate_limiter: RateLimiter::new(min_interval),
            tracked,
        }
    }

    pub async fn resolve(&self, identity: &ExtractedIdentity) -> AppResult<Resolution> {
        let key = CacheKey::for_reference(&identity.reference);
        let cached = self.cache.lock().get(&key).cloned();

        // A low-trust id is never answered from a trusted resolution of the
        // same id; the marker only fills an empty slot.
        if identity.low_trust {
            if let LocationReference::OpaqueId { id } = &identity.reference {
                warn!(
                    id = %id,
                    path_name = identity.path_name.as_deref().unwrap_or_default(),
                    "opaque id sits next to a place name it may not belong to; not looking it up"
                );
                let source = match cached {
                    Some(_) => ResolutionSource::Cache,
                    None => {
                        self.remember_failure(key, UnresolvableReason::AmbiguousIdentifier)?;
                        ResolutionSource::ShortCircuit
                    }
                };
                return Ok(Resolution::new(
                    source,
                    Err(FailureReason::AmbiguousIdentifier),
                ));
            }
        }

        if let Some(value) = cached {
            debug!(key = %key.key, "cache hit");
            let outcome = match value {
                CacheValue::Resolved(place) => Ok(place),
                CacheValue::Unresolvable { reason } => Err(reason.into()),
            };
            return Ok(Resolution::new(ResolutionSource::Cache, outcome));
        }

        let query = match &identity.reference {
            LocationReference::OpaqueId { id } => match customer_id(id) {
                Some(cid) => GeocodeQuery::CustomerId(cid),
                None => {
                    debug!(id = %id, "opaque id has no usable customer id");
                    self.remember_failure(key, UnresolvableReason::NoMatch)?;
                    return Ok(Resolution::new(
                        ResolutionSource::ShortCircuit,
                        Err(FailureReason::NoMatch),
                    ));
                }
            },
            LocationReference::Coordinate { lat, lng } => GeocodeQuery::Coordinate {
                lat: *lat,
                lng: *lng,
            },
            LocationReference::PlaceName { name } => GeocodeQuery::Address(name.trim().to_string()),
        };

        self.rate_limiter.wait().await;
        let response = self.lookup.geocode(&query).await;

        let outcome = match response {
            Ok(components) => match self.normalize(components, &identity.reference) {
                Some(place) => {
                    self.cache
                        .lock()
                        .put(key, CacheValue::Resolved(place.clone()))?;
                    Ok(place)
                }
                None => {
                    debug!(reference = %identity.reference, "answer has no country component");
                    self.remember_failure(key, UnresolvableReason::NoMatch)?;
                    Err(FailureReason::NoMatch)
                }
            },
            Err(GeocodeError::NoMatch) => {
                self.remember_failure(key, UnresolvableReason::NoMatch)?;
                Err(FailureReason::NoMatch)
            }
            Err(GeocodeError::Network(detail)) => {
                warn!(reference = %identity.reference, %detail, "geocoding request failed; will retry next run");
                Err(FailureReason::TransientNetwork)
            }
            Err(GeocodeError::Provider(detail)) => {
                warn!(reference = %identity.reference, %detail, "geocoding provider refused the request");
                Err(FailureReason::ProviderError)
            }
        };
        Ok(Resolution::new(ResolutionSource::Api, outcome))
    }

    fn remember_failure(&self, key: CacheKey, reason: UnresolvableReason) -> AppResult<()> {
        self.cache
            .lock()
            .put(key, CacheValue::Unresolvable { reason })
    }

    fn normalize(
        &self,
        components: AddressComponents,
        reference: &LocationReference,
    ) -> Option<ResolvedPlace> {
        let country = components
            .country
            .filter(|country| !country.long_name.trim().is_empty())?;

        let state = if self
            .tracked
            .tracks(&country.long_name, country.short_name.as_deref())
        {
            components
                .admin_area
                .and_then(|area| StateRef::new(area.long_name, area.short_name))
        } else {
            None
        };

        let coordinates = components.location.or(match reference {
            LocationReference::Coordinate { lat, lng } => Some((*lat, *lng)),
            _ => None,
        });

        let place = ResolvedPlace::new(country.long_name.trim()).with_state(state);
        Some(match coordinates {
            Some((lat, lng)) => place.with_coordinates(lat, lng),
            None => place,
        })
    }
}

struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_tick: AsyncMutex::new(None),
        }
    }

    async fn wait(&self) {
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}
