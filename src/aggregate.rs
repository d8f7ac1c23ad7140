use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ingestion::RawRecord;
use crate::place::{FailureReason, ResolvedPlace, StateRef};

/// Coordinates rendered with fixed precision so exports diff cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub lat: String,
    pub lng: String,
}

impl Location {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self {
            lat: format!("{lat:.6}"),
            lng: format!("{lng:.6}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryAggregate {
    pub country: String,
    pub count: usize,
    pub states: Vec<StateRef>,
    pub locations: Vec<Location>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedLookup {
    pub title: String,
    pub url: String,
    pub reason: FailureReason,
}

/// Folds resolutions into per-country tallies in first-seen order.
#[derive(Debug, Default)]
pub struct Aggregator {
    countries: Vec<CountryAggregate>,
    index: HashMap<String, usize>,
    failed: Vec<FailedLookup>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_resolved(&mut self, place: &ResolvedPlace) {
        let position = match self.index.get(&place.country) {
            Some(position) => {
                self.countries[*position].count += 1;
                *position
            }
            None => {
                self.countries.push(CountryAggregate {
                    country: place.country.clone(),
                    count: 1,
                    states: Vec::new(),
                    locations: Vec::new(),
                });
                let position = self.countries.len() - 1;
                self.index.insert(place.country.clone(), position);
                position
            }
        };

        let aggregate = &mut self.countries[position];
        if let Some(state) = &place.state {
            // First sighting of a state decides its code.
            if !aggregate.states.iter().any(|known| known.name == state.name) {
                aggregate.states.push(state.clone());
            }
        }
        if let Some((lat, lng)) = place.coordinates() {
            aggregate.locations.push(Location::new(lat, lng));
        }
    }

    pub fn add_failure(&mut self, record: &RawRecord, reason: FailureReason) {
        self.failed.push(FailedLookup {
            title: record.title.clone(),
            url: record.url.clone(),
            reason,
        });
    }

    pub fn countries(&self) -> &[CountryAggregate] {
        &self.countries
    }

    pub fn failed(&self) -> &[FailedLookup] {
        &self.failed
    }

    pub fn into_parts(self) -> (Vec<CountryAggregate>, Vec<FailedLookup>) {
        (self.countries, self.failed)
    }
}
