//! Generation-tagged slot table for handles owned by a connection session.
//!
//! Statement and blob facades never hold a reference into the session; they
//! hold a [`RegistryKey`]. Removing an entry bumps its slot generation, so a key
//! issued before the removal can never resolve to whatever reuses the slot.

use crate::error::LaneError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistryKey {
    index: u32,
    generation: u32,
}

impl RegistryKey {
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub(crate) struct Registry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> Registry<T> {
    pub(crate) fn insert(&mut self, value: T) -> Result<RegistryKey, LaneError> {
        let index = if let Some(index) = self.free.pop() {
            index
        } else {
            let index = u32::try_from(self.slots.len())
                .map_err(|_| LaneError::ArgumentError("too many open handles".into()))?;
            self.slots.push(Slot {
                generation: 0,
                value: None,
            });
            index
        };
        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        self.len += 1;
        Ok(RegistryKey {
            index,
            generation: slot.generation,
        })
    }

    pub(crate) fn get(&self, key: RegistryKey) -> Option<&T> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub(crate) fn get_mut(&mut self, key: RegistryKey) -> Option<&mut T> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub(crate) fn remove(&mut self, key: RegistryKey) -> Option<T> {
        let slot = self
            .slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)?;
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.len -= 1;
        Some(value)
    }

    /// Drop every live entry and invalidate all outstanding keys.
    pub(crate) fn clear(&mut self) -> usize {
        let removed = self.len;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.value.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                if let Ok(index) = u32::try_from(index) {
                    self.free.push(index);
                }
            }
        }
        self.len = 0;
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}
