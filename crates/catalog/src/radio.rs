use common::{natural_id, RadioStation};
use redb::ReadableTable;

use crate::{
    decode_id, decode_value, encode_value, join_key, prefix_end, prefix_key, Catalog,
    CatalogError, KEY_SEP, STATIONS_BY_USER_TABLE, STATIONS_TABLE,
};

pub fn station_id(user_id: &str, remote_uuid: &str) -> String {
    natural_id(&[user_id, remote_uuid])
}

impl Catalog {
    /// Upserts stations by (user, remote uuid). Favorite flags and stored
    /// favicons survive re-imports. Returns the ids of stations seen for the
    /// first time.
    pub fn upsert_stations(
        &self,
        user_id: &str,
        stations: Vec<RadioStation>,
    ) -> Result<Vec<String>, CatalogError> {
        let mut created = Vec::new();
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(STATIONS_TABLE)?;
            let mut index = write_txn.open_table(STATIONS_BY_USER_TABLE)?;
            for mut station in stations {
                station.id = station_id(user_id, &station.remote_uuid);
                station.user_id = user_id.to_string();
                let existing: Option<RadioStation> = match table.get(station.id.as_str())? {
                    Some(value) => Some(decode_value(value.value())?),
                    None => None,
                };
                match existing {
                    Some(existing) => {
                        station.favorited = existing.favorited;
                        if station.favicon.is_none() {
                            station.favicon = existing.favicon;
                        }
                        if existing.name != station.name {
                            let old_key = station_index_key(user_id, &existing.name, &existing.id);
                            index.remove(old_key.as_str())?;
                        }
                    }
                    None => created.push(station.id.clone()),
                }
                let bytes = encode_value(&station)?;
                table.insert(station.id.as_str(), bytes.as_slice())?;
                let index_key = station_index_key(user_id, &station.name, &station.id);
                index.insert(index_key.as_str(), station.id.as_bytes())?;
            }
        }
        write_txn.commit()?;
        Ok(created)
    }

    pub fn get_station(
        &self,
        user_id: &str,
        id: &str,
    ) -> Result<Option<RadioStation>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(STATIONS_TABLE)?;
        let station: Option<RadioStation> = match table.get(id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(station.filter(|station| station.user_id == user_id))
    }

    /// Stations ordered by name. `search` matches a case-insensitive substring
    /// of the name.
    pub fn list_stations(
        &self,
        user_id: &str,
        search: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<RadioStation>, usize), CatalogError> {
        let search = search
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(|value| value.to_lowercase());
        self.page_stations(user_id, search.as_deref(), false, limit, offset)
    }

    /// Favorited stations ordered by name.
    pub fn list_favorite_stations(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<RadioStation>, usize), CatalogError> {
        self.page_stations(user_id, None, true, limit, offset)
    }

    fn page_stations(
        &self,
        user_id: &str,
        search: Option<&str>,
        favorites_only: bool,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<RadioStation>, usize), CatalogError> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(STATIONS_BY_USER_TABLE)?;
        let table = read_txn.open_table(STATIONS_TABLE)?;

        let prefix = prefix_key(user_id);
        let end = prefix_end(&prefix);
        let mut total = 0usize;
        let mut items = Vec::new();
        for entry in index.range(prefix.as_str()..end.as_str())? {
            let entry = entry?;
            if let Some(search) = search {
                let key = entry.0.value();
                let name = key[prefix.len()..].split(KEY_SEP).next().unwrap_or("");
                if !name.contains(search) {
                    continue;
                }
            }
            let id = decode_id(entry.1.value())?;
            let mut loaded = None;
            if favorites_only {
                match table.get(id.as_str())? {
                    Some(value) => {
                        let station: RadioStation = decode_value(value.value())?;
                        if !station.favorited {
                            continue;
                        }
                        loaded = Some(station);
                    }
                    None => continue,
                }
            }
            total += 1;
            if total <= offset || items.len() >= limit {
                continue;
            }
            let station = match loaded {
                Some(station) => Some(station),
                None => match table.get(id.as_str())? {
                    Some(value) => Some(decode_value(value.value())?),
                    None => None,
                },
            };
            items.extend(station);
        }
        Ok((items, total))
    }

    pub fn set_station_favorite(
        &self,
        user_id: &str,
        id: &str,
        favorited: bool,
    ) -> Result<bool, CatalogError> {
        self.update_station(user_id, id, |station| station.favorited = favorited)
    }

    pub fn set_station_favicon(
        &self,
        user_id: &str,
        id: &str,
        favicon: Vec<u8>,
    ) -> Result<bool, CatalogError> {
        self.update_station(user_id, id, move |station| station.favicon = Some(favicon))
    }

    fn update_station<F>(&self, user_id: &str, id: &str, apply: F) -> Result<bool, CatalogError>
    where
        F: FnOnce(&mut RadioStation),
    {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(STATIONS_TABLE)?;
            let mut station: RadioStation = match table.get(id)? {
                Some(value) => decode_value(value.value())?,
                None => return Ok(false),
            };
            if station.user_id != user_id {
                return Ok(false);
            }
            apply(&mut station);
            let bytes = encode_value(&station)?;
            table.insert(id, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(true)
    }
}

fn station_index_key(user_id: &str, name: &str, id: &str) -> String {
    join_key(&[user_id, &name.to_lowercase(), id])
}
