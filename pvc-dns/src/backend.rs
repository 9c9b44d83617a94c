//! The zone storage seam.
//!
//! PowerDNS serves zones out of a shared PostgreSQL database; the
//! aggregator maintains them through this trait. Tests use the in-memory
//! implementation.

use anyhow::{format_err, Error};

/// One record row as stored in the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: i32,
    pub name: String,
    pub rtype: String,
    pub ttl: u32,
    pub content: String,
}

pub trait ZoneBackend: Send {
    /// Create the domain with its SOA and NS seed records if missing.
    fn ensure_domain(
        &mut self,
        domain: &str,
        soa_content: &str,
        name_servers: &[String],
    ) -> Result<(), Error>;

    /// Drop the domain and all its records.
    fn remove_domain(&mut self, domain: &str) -> Result<(), Error>;

    /// All records of the domain.
    fn domain_records(&mut self, domain: &str) -> Result<Vec<StoredRecord>, Error>;

    fn insert_record(
        &mut self,
        domain: &str,
        name: &str,
        rtype: &str,
        ttl: u32,
        content: &str,
    ) -> Result<(), Error>;

    fn delete_record(&mut self, domain: &str, id: i32) -> Result<(), Error>;

    /// Increment the zone's SOA serial, returning the new value.
    fn bump_soa_serial(&mut self, domain: &str) -> Result<u64, Error>;
}

/// PostgreSQL implementation over the standard PowerDNS gpgsql schema.
pub struct PostgresBackend {
    client: postgres::Client,
}

impl PostgresBackend {
    pub fn connect(
        host: &str,
        port: u16,
        dbname: &str,
        user: &str,
        password: &str,
    ) -> Result<Self, Error> {
        let client = postgres::Client::connect(
            &format!(
                "host={host} port={port} dbname={dbname} user={user} password={password} \
                 sslmode=disable"
            ),
            postgres::NoTls,
        )?;
        Ok(PostgresBackend { client })
    }

    fn domain_id(&mut self, domain: &str) -> Result<Option<i32>, Error> {
        let row = self
            .client
            .query_opt("SELECT id FROM domains WHERE name = $1", &[&domain])?;
        Ok(row.map(|row| row.get(0)))
    }
}

impl ZoneBackend for PostgresBackend {
    fn ensure_domain(
        &mut self,
        domain: &str,
        soa_content: &str,
        name_servers: &[String],
    ) -> Result<(), Error> {
        if self.domain_id(domain)?.is_some() {
            return Ok(());
        }
        self.client.execute(
            "INSERT INTO domains (name, type, account, notified_serial) \
             VALUES ($1, 'MASTER', 'internal', 0)",
            &[&domain],
        )?;
        let id = self
            .domain_id(domain)?
            .ok_or_else(|| format_err!("domain {domain} missing after insert"))?;
        self.client.execute(
            "INSERT INTO records (domain_id, name, content, type, ttl, prio) \
             VALUES ($1, $2, $3, 'SOA', 86400, 0)",
            &[&id, &domain, &soa_content],
        )?;
        for server in name_servers {
            self.client.execute(
                "INSERT INTO records (domain_id, name, content, type, ttl, prio) \
                 VALUES ($1, $2, $3, 'NS', 86400, 0)",
                &[&id, &domain, server],
            )?;
        }
        Ok(())
    }

    fn remove_domain(&mut self, domain: &str) -> Result<(), Error> {
        if let Some(id) = self.domain_id(domain)? {
            self.client
                .execute("DELETE FROM records WHERE domain_id = $1", &[&id])?;
            self.client
                .execute("DELETE FROM domains WHERE id = $1", &[&id])?;
        }
        Ok(())
    }

    fn domain_records(&mut self, domain: &str) -> Result<Vec<StoredRecord>, Error> {
        let Some(id) = self.domain_id(domain)? else {
            return Ok(Vec::new());
        };
        let rows = self.client.query(
            "SELECT id, name, type, ttl, content FROM records WHERE domain_id = $1",
            &[&id],
        )?;
        Ok(rows
            .iter()
            .map(|row| StoredRecord {
                id: row.get(0),
                name: row.get(1),
                rtype: row.get(2),
                ttl: row.get::<_, i32>(3) as u32,
                content: row.get(4),
            })
            .collect())
    }

    fn insert_record(
        &mut self,
        domain: &str,
        name: &str,
        rtype: &str,
        ttl: u32,
        content: &str,
    ) -> Result<(), Error> {
        let id = self
            .domain_id(domain)?
            .ok_or_else(|| format_err!("unknown domain {domain}"))?;
        self.client.execute(
            "INSERT INTO records (domain_id, name, ttl, type, prio, content) \
             VALUES ($1, $2, $3, $4, 0, $5)",
            &[&id, &name, &(ttl as i32), &rtype, &content],
        )?;
        Ok(())
    }

    fn delete_record(&mut self, _domain: &str, id: i32) -> Result<(), Error> {
        self.client
            .execute("DELETE FROM records WHERE id = $1", &[&id])?;
        Ok(())
    }

    fn bump_soa_serial(&mut self, domain: &str) -> Result<u64, Error> {
        let id = self
            .domain_id(domain)?
            .ok_or_else(|| format_err!("unknown domain {domain}"))?;
        let row = self.client.query_one(
            "SELECT content FROM records WHERE domain_id = $1 AND type = 'SOA'",
            &[&id],
        )?;
        let content: String = row.get(0);
        let (content, serial) = bump_soa_content(&content)?;
        self.client.execute(
            "UPDATE records SET content = $1 WHERE domain_id = $2 AND type = 'SOA'",
            &[&content, &id],
        )?;
        Ok(serial)
    }
}

/// Increment the serial (third field) of an SOA content string.
pub(crate) fn bump_soa_content(content: &str) -> Result<(String, u64), Error> {
    let mut fields: Vec<String> = content.split_whitespace().map(str::to_owned).collect();
    if fields.len() < 3 {
        return Err(format_err!("malformed SOA content '{content}'"));
    }
    let serial: u64 = fields[2]
        .parse()
        .map_err(|_| format_err!("malformed SOA serial in '{content}'"))?;
    let serial = serial + 1;
    fields[2] = serial.to_string();
    Ok((fields.join(" "), serial))
}

/// In-memory backend for tests and dry runs.
#[derive(Default)]
pub struct MemBackend {
    next_id: i32,
    domains: Vec<(String, Vec<StoredRecord>)>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn domain_mut(&mut self, domain: &str) -> Option<&mut Vec<StoredRecord>> {
        self.domains
            .iter_mut()
            .find(|(name, _)| name == domain)
            .map(|(_, records)| records)
    }

    /// The current SOA serial of a domain, for assertions.
    pub fn soa_serial(&self, domain: &str) -> Option<u64> {
        let records = &self.domains.iter().find(|(name, _)| name == domain)?.1;
        let soa = records.iter().find(|record| record.rtype == "SOA")?;
        soa.content.split_whitespace().nth(2)?.parse().ok()
    }
}

impl ZoneBackend for MemBackend {
    fn ensure_domain(
        &mut self,
        domain: &str,
        soa_content: &str,
        name_servers: &[String],
    ) -> Result<(), Error> {
        if self.domain_mut(domain).is_some() {
            return Ok(());
        }
        let mut records = Vec::new();
        self.next_id += 1;
        records.push(StoredRecord {
            id: self.next_id,
            name: domain.to_owned(),
            rtype: "SOA".to_owned(),
            ttl: 86400,
            content: soa_content.to_owned(),
        });
        for server in name_servers {
            self.next_id += 1;
            records.push(StoredRecord {
                id: self.next_id,
                name: domain.to_owned(),
                rtype: "NS".to_owned(),
                ttl: 86400,
                content: server.clone(),
            });
        }
        self.domains.push((domain.to_owned(), records));
        Ok(())
    }

    fn remove_domain(&mut self, domain: &str) -> Result<(), Error> {
        self.domains.retain(|(name, _)| name != domain);
        Ok(())
    }

    fn domain_records(&mut self, domain: &str) -> Result<Vec<StoredRecord>, Error> {
        Ok(self.domain_mut(domain).cloned().unwrap_or_default())
    }

    fn insert_record(
        &mut self,
        domain: &str,
        name: &str,
        rtype: &str,
        ttl: u32,
        content: &str,
    ) -> Result<(), Error> {
        self.next_id += 1;
        let record = StoredRecord {
            id: self.next_id,
            name: name.to_owned(),
            rtype: rtype.to_owned(),
            ttl,
            content: content.to_owned(),
        };
        self.domain_mut(domain)
            .ok_or_else(|| format_err!("unknown domain {domain}"))?
            .push(record);
        Ok(())
    }

    fn delete_record(&mut self, domain: &str, id: i32) -> Result<(), Error> {
        if let Some(records) = self.domain_mut(domain) {
            records.retain(|record| record.id != id);
        }
        Ok(())
    }

    fn bump_soa_serial(&mut self, domain: &str) -> Result<u64, Error> {
        let records = self
            .domain_mut(domain)
            .ok_or_else(|| format_err!("unknown domain {domain}"))?;
        let soa = records
            .iter_mut()
            .find(|record| record.rtype == "SOA")
            .ok_or_else(|| format_err!("domain {domain} has no SOA"))?;
        let (content, serial) = bump_soa_content(&soa.content)?;
        soa.content = content;
        Ok(serial)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bump_soa_content() {
        let (content, serial) =
            bump_soa_content("nsX.example.tld root.example.tld 41 10800 1800 86400 86400").unwrap();
        assert_eq!(serial, 42);
        assert!(content.contains(" 42 "));
        assert!(bump_soa_content("short").is_err());
    }
}
