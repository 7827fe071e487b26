//! Conversion between [`HostValue`] and guest values.
//!
//! Handles become `{ __handle, id }` objects and come back as handles.
//! Component records become live views (a `Proxy` built by the SDK) whose
//! reads and writes go through [`FieldAccess`] on the shared record. The
//! record table maps view ids back to records. Records lent to the guest
//! as call arguments are held only while a [`RecordLease`] is alive;
//! records the guest obtains on its own (`clone()`, factories) stay until
//! the generation closes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use rquickjs::{Array, Ctx, Function, Object, Value};

use crate::value::{FieldRecord, Handle, HostValue};

/// Nesting depth beyond which guest values are cut off as `Null`.
const MAX_DEPTH: usize = 32;

/// Largest integer a guest number represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Field marking a handle object.
pub(crate) const HANDLE_KEY: &str = "__handle";
/// Field exposing the record id of a component view.
pub(crate) const RECORD_KEY: &str = "__hsRecord";
/// SDK function turning a record id into a view.
const RECORD_VIEW_FN: &str = "__hsRecordView";

#[derive(Debug)]
struct Tracked {
    record: Arc<FieldRecord>,
    leases: usize,
    pinned: bool,
}

/// Converter plus the record table of the current generation.
#[derive(Debug, Default)]
pub struct Marshal {
    records: Mutex<HashMap<u64, Tracked>>,
}

impl Marshal {
    /// Record behind a view id.
    pub fn record(&self, id: u64) -> Option<Arc<FieldRecord>> {
        self.lock().get(&id).map(|t| Arc::clone(&t.record))
    }

    /// Make `record` reachable from guest views until the generation
    /// closes; returns its id.
    pub fn track(&self, record: &Arc<FieldRecord>) -> u64 {
        let id = record.id();
        self.lock()
            .entry(id)
            .and_modify(|t| t.pinned = true)
            .or_insert_with(|| Tracked {
                record: Arc::clone(record),
                leases: 0,
                pinned: true,
            });
        id
    }

    /// Lend every record inside `args` to the guest until the returned
    /// lease drops.
    pub fn lease(&self, args: &[HostValue]) -> RecordLease<'_> {
        let mut found = Vec::new();
        for arg in args {
            collect_records(arg, &mut found);
        }
        let mut records = self.lock();
        let ids = found
            .into_iter()
            .map(|record| {
                let id = record.id();
                records
                    .entry(id)
                    .or_insert_with(|| Tracked {
                        record,
                        leases: 0,
                        pinned: false,
                    })
                    .leases += 1;
                id
            })
            .collect();
        RecordLease { marshal: self, ids }
    }

    fn release(&self, ids: &[u64]) {
        let mut records = self.lock();
        for id in ids {
            if let Some(tracked) = records.get_mut(id) {
                tracked.leases = tracked.leases.saturating_sub(1);
                if tracked.leases == 0 && !tracked.pinned {
                    records.remove(id);
                }
            }
        }
    }

    /// Forget every tracked record. Called when a generation closes.
    pub fn clear_records(&self) {
        self.lock().clear();
    }

    /// Number of tracked records.
    pub fn record_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Tracked>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Convert a host value into the guest.
    pub fn to_js<'js>(&self, ctx: &Ctx<'js>, value: &HostValue) -> rquickjs::Result<Value<'js>> {
        Ok(match value {
            HostValue::Null => Value::new_null(ctx.clone()),
            HostValue::Bool(b) => Value::new_bool(ctx.clone(), *b),
            HostValue::Int(i) => match i32::try_from(*i) {
                Ok(small) => Value::new_int(ctx.clone(), small),
                Err(_) => Value::new_float(ctx.clone(), *i as f64),
            },
            HostValue::Float(f) => Value::new_float(ctx.clone(), *f),
            HostValue::String(s) => rquickjs::String::from_str(ctx.clone(), s)?.into_value(),
            HostValue::List(items) => {
                let array = Array::new(ctx.clone())?;
                for (i, item) in items.iter().enumerate() {
                    array.set(i, self.to_js(ctx, item)?)?;
                }
                array.into_value()
            }
            HostValue::Map(map) => {
                let object = Object::new(ctx.clone())?;
                for (key, item) in map {
                    object.set(key.as_str(), self.to_js(ctx, item)?)?;
                }
                object.into_value()
            }
            HostValue::Handle(handle) => handle_to_js(ctx, handle)?,
            HostValue::Record(record) => {
                let id = self.view_id(record) as f64;
                let view: Option<Function> = ctx.globals().get(RECORD_VIEW_FN)?;
                match view {
                    Some(view) => view.call((id,))?,
                    None => {
                        let object = Object::new(ctx.clone())?;
                        object.set(RECORD_KEY, id)?;
                        object.into_value()
                    }
                }
            }
        })
    }

    /// Id of a record about to become a view; leased records keep their
    /// lease, anything else is pinned.
    fn view_id(&self, record: &Arc<FieldRecord>) -> u64 {
        if self.lock().contains_key(&record.id()) {
            return record.id();
        }
        self.track(record)
    }

    /// Snapshot a guest value. Never fails: anything unrepresentable
    /// (functions, symbols, cyclic or overly deep structures) becomes `Null`.
    pub fn from_js<'js>(&self, ctx: &Ctx<'js>, value: &Value<'js>) -> HostValue {
        self.from_js_depth(ctx, value, 0)
    }

    fn from_js_depth<'js>(&self, ctx: &Ctx<'js>, value: &Value<'js>, depth: usize) -> HostValue {
        if depth > MAX_DEPTH || value.is_null() || value.is_undefined() || value.is_function() {
            return HostValue::Null;
        }
        if let Some(b) = value.as_bool() {
            return HostValue::Bool(b);
        }
        if let Some(i) = value.as_int() {
            return HostValue::Int(i64::from(i));
        }
        if let Some(f) = value.as_float() {
            return number(f);
        }
        if let Some(s) = value.as_string() {
            return s.to_string().map_or(HostValue::Null, HostValue::String);
        }
        if let Some(array) = value.as_array() {
            return HostValue::List(
                array
                    .iter::<Value>()
                    .map(|item| item.map_or(HostValue::Null, |v| self.from_js_depth(ctx, &v, depth + 1)))
                    .collect(),
            );
        }
        let Some(object) = value.as_object() else {
            return HostValue::Null;
        };

        if let Some(handle) = handle_from_js(object) {
            return HostValue::Handle(handle);
        }
        if let Ok(Some(id)) = object.get::<_, Option<f64>>(RECORD_KEY) {
            return self.record(id as u64).map_or(HostValue::Null, HostValue::Record);
        }

        let mut map = BTreeMap::new();
        for key in object.keys::<String>().flatten() {
            let Ok(item) = object.get::<_, Value>(key.as_str()) else {
                continue;
            };
            map.insert(key, self.from_js_depth(ctx, &item, depth + 1));
        }
        HostValue::Map(map)
    }
}

/// Records lent to the guest for the duration of one call.
#[derive(Debug)]
pub struct RecordLease<'a> {
    marshal: &'a Marshal,
    ids: Vec<u64>,
}

impl Drop for RecordLease<'_> {
    fn drop(&mut self) {
        if !self.ids.is_empty() {
            self.marshal.release(&self.ids);
        }
    }
}

fn collect_records(value: &HostValue, out: &mut Vec<Arc<FieldRecord>>) {
    match value {
        HostValue::Record(record) => out.push(Arc::clone(record)),
        HostValue::List(items) => items.iter().for_each(|item| collect_records(item, out)),
        HostValue::Map(map) => map.values().for_each(|item| collect_records(item, out)),
        _ => {}
    }
}

fn number(f: f64) -> HostValue {
    if f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER {
        HostValue::Int(f as i64)
    } else {
        HostValue::Float(f)
    }
}

fn handle_to_js<'js>(ctx: &Ctx<'js>, handle: &Handle) -> rquickjs::Result<Value<'js>> {
    let object = Object::new(ctx.clone())?;
    object.set(HANDLE_KEY, handle.kind.as_str())?;
    object.set("id", handle.id as f64)?;
    Ok(object.into_value())
}

fn handle_from_js(object: &Object<'_>) -> Option<Handle> {
    let kind = object.get::<_, Option<String>>(HANDLE_KEY).ok().flatten()?;
    let id = object.get::<_, Option<f64>>("id").ok().flatten()?;
    Some(Handle::new(kind, id as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::engine::GuestEngine;
    use crate::value::FieldAccess;

    fn round_trip(source: &str) -> HostValue {
        let engine = GuestEngine::new().unwrap();
        let runtime = engine.create_runtime(1).unwrap();
        let marshal = Marshal::default();
        runtime.with(|ctx| {
            let value: Value = ctx.eval(source).unwrap();
            marshal.from_js(&ctx, &value)
        })
    }

    #[test]
    fn test_guest_object_snapshot() {
        let value = round_trip("({ name: 'zombie', hp: 20, speed: 0.5, tags: ['a', 'b'], onTick() {} })");
        assert_eq!(
            value,
            HostValue::map([
                ("hp", HostValue::Int(20)),
                ("name", HostValue::from("zombie")),
                ("onTick", HostValue::Null),
                ("speed", HostValue::Float(0.5)),
                ("tags", HostValue::List(vec![HostValue::from("a"), HostValue::from("b")])),
            ])
        );
    }

    #[test]
    fn test_integral_floats_normalize_to_int() {
        assert_eq!(round_trip("6 / 2"), HostValue::Int(3));
        assert_eq!(round_trip("2 ** 60"), HostValue::Float(2f64.powi(60)));
    }

    #[test]
    fn test_cycles_are_cut() {
        let value = round_trip("(() => { const a = {}; a.self = a; return a; })()");
        let mut depth = 0;
        let mut cursor = &value;
        while let Some(next) = cursor.get("self") {
            cursor = next;
            depth += 1;
        }
        assert!(depth <= MAX_DEPTH + 1);
    }

    #[test]
    fn test_handles_survive_the_guest() {
        let engine = GuestEngine::new().unwrap();
        let runtime = engine.create_runtime(1).unwrap();
        let marshal = Marshal::default();
        let handle = HostValue::handle("world", 3);

        let (back, kind): (HostValue, String) = runtime.with(|ctx| {
            let js = marshal.to_js(&ctx, &handle).unwrap();
            ctx.globals().set("w", js.clone()).unwrap();
            let kind: String = ctx.eval("w.__handle").unwrap();
            (marshal.from_js(&ctx, &js), kind)
        });
        assert_eq!(back, handle);
        assert_eq!(kind, "world");
    }

    #[test]
    fn test_record_without_sdk_falls_back_to_id_object() {
        let engine = GuestEngine::new().unwrap();
        let runtime = engine.create_runtime(1).unwrap();
        let marshal = Marshal::default();
        let record = Arc::new(FieldRecord::new(BTreeMap::new()));
        record.set("x", HostValue::Int(1));

        let back = runtime.with(|ctx| {
            let js = marshal.to_js(&ctx, &HostValue::Record(Arc::clone(&record))).unwrap();
            marshal.from_js(&ctx, &js)
        });
        assert_eq!(back, HostValue::Record(record));
        assert_eq!(marshal.record_count(), 1);
        marshal.clear_records();
        assert_eq!(marshal.record_count(), 0);
    }

    #[test]
    fn test_leased_records_leave_the_table() {
        let engine = GuestEngine::new().unwrap();
        let runtime = engine.create_runtime(1).unwrap();
        let marshal = Marshal::default();
        let lent = Arc::new(FieldRecord::new(BTreeMap::new()));
        let kept = Arc::new(FieldRecord::new(BTreeMap::new()));
        let args = [HostValue::List(vec![HostValue::Record(Arc::clone(&lent))])];

        runtime.with(|ctx| {
            let lease = marshal.lease(&args);
            marshal.to_js(&ctx, &args[0]).unwrap();
            marshal.to_js(&ctx, &HostValue::Record(Arc::clone(&kept))).unwrap();
            assert_eq!(marshal.record_count(), 2);
            drop(lease);
        });
        assert!(marshal.record(lent.id()).is_none());
        assert!(marshal.record(kept.id()).is_some());
    }

    #[test]
    fn test_nested_leases_release_on_last_drop() {
        let marshal = Marshal::default();
        let record = Arc::new(FieldRecord::new(BTreeMap::new()));
        let args = [HostValue::Record(Arc::clone(&record))];

        let outer = marshal.lease(&args);
        let inner = marshal.lease(&args);
        drop(inner);
        assert_eq!(marshal.record_count(), 1);
        drop(outer);
        assert_eq!(marshal.record_count(), 0);
    }
}
