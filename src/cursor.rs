use crate::errof;
use crate::errors::Result;
use crate::expr::{AggState, EvalCtx};
use crate::index::{Index, SlotMask};
use crate::plan::{Plan, ReaderSpec, TargetDef};
use crate::reader::{Buffer, Fullscan, Range, RangeMode, Reader, Search, Seq};
use crate::scope::Scope;
use crate::types::{Value, Vertex};
use crate::wire;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

struct PageSnap {
    data: Vec<u8>,
    nrec: usize,
    mask: Option<SlotMask>,
    per_page: usize,
}

/// Query execution handle: drives the reader tree through filter,
/// vertex-row reconstruction, expression evaluation and aggregation,
/// emitting framed rows into caller buffers. The buffer boundary is not a
/// row boundary; partial rows carry over to the next fetch.
pub struct Cursor {
    plan: Plan,
    root: Box<dyn Reader>,
    ctx: EvalCtx,
    recsize: usize,
    page: Option<PageSnap>,
    rec_idx: usize,
    forced: bool,
    prepared: bool,
    rows: VecDeque<Vec<Value>>,
    pending: Vec<u8>,
    stop: Arc<AtomicBool>,
    eof: bool,
    /// Rows emitted so far (diagnostics).
    pub total_rows: u64,
}

impl Cursor {
    /// Build the reader tree for a plan and attach the pipeline.
    pub fn new(scope: &Scope, plan: Plan, stop: Arc<AtomicBool>) -> Result<Self> {
        let (start, end) = plan
            .full_filter
            .as_ref()
            .map_or((crate::time::DAWN, crate::time::DUSK), crate::filter::Filter::period);
        // tail snapshot before the index materialises its hits
        let tail = plan.store.get_pending_tail();
        let files = plan.store.get_files(start, end);
        let recsize = plan.store.cfg.recsize as usize;
        if files.is_empty() {
            // the period pruned everything
            let root: Box<dyn Reader> = match tail {
                Some((file, off)) => Box::new(Buffer::from_tail(file, off)?),
                None => Box::new(Buffer::empty(recsize)),
            };
            let ctx = EvalCtx::new(Some(scope.text.clone()));
            return Ok(Self {
                plan,
                root,
                ctx,
                recsize,
                page: None,
                rec_idx: 0,
                forced: false,
                prepared: false,
                rows: VecDeque::new(),
                pending: Vec::new(),
                stop,
                eof: false,
                total_rows: 0,
            });
        }
        let primary: Box<dyn Reader> = match &plan.reader {
            ReaderSpec::Fullscan => Box::new(Fullscan::new(files)?),
            ReaderSpec::Search { index, key } => {
                Box::new(Search::new(files, Arc::clone(index), key.clone())?)
            }
            ReaderSpec::Range { index, start, end } => Box::new(Range::new(
                files,
                Arc::clone(index),
                RangeMode::Full,
                Some(start.clone()),
                Some(end.clone()),
            )?),
            ReaderSpec::KeyRange { index, start, end } => Box::new(Range::new(
                files,
                Arc::clone(index),
                RangeMode::Keys,
                start.clone(),
                end.clone(),
            )?),
            ReaderSpec::CountRange { index, start, end } => Box::new(Range::new(
                files,
                Arc::clone(index),
                RangeMode::Counts,
                Some(start.clone()),
                Some(end.clone()),
            )?),
        };
        let root: Box<dyn Reader> = match (&plan.reader, tail) {
            (ReaderSpec::Fullscan, _) | (_, None) => primary,
            (_, Some((file, off))) => {
                let tail_buf = Buffer::from_tail(file, off)?;
                Box::new(Seq::new(vec![primary, Box::new(tail_buf)])?)
            }
        };
        let ctx = EvalCtx::new(Some(scope.text.clone()));
        Ok(Self {
            plan,
            root,
            ctx,
            recsize,
            page: None,
            rec_idx: 0,
            forced: false,
            prepared: false,
            rows: VecDeque::new(),
            pending: Vec::new(),
            stop,
            eof: false,
            total_rows: 0,
        })
    }

    /// Position all readers at the start.
    pub fn open(&mut self) -> Result<()> {
        self.root.rewind()
    }

    fn materializes(&self) -> bool {
        self.plan.has_aggs()
            || !self.plan.group_by.is_empty()
            || !self.plan.order_by.is_empty()
            || matches!(
                self.plan.reader,
                ReaderSpec::KeyRange { .. } | ReaderSpec::CountRange { .. }
            )
    }

    /// Pull the next candidate record from the reader tree, honouring the
    /// slot masks of index-driven readers. Cancellation is checked
    /// between page fetches.
    fn pull_record(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(p) = &self.page {
                while self.rec_idx < p.nrec {
                    let i = self.rec_idx;
                    self.rec_idx += 1;
                    if let Some(mask) = p.mask {
                        let slot = Index::slot_of(p.per_page, i);
                        if mask & (1u128 << (slot & 127)) == 0 {
                            continue;
                        }
                    }
                    return Ok(Some(p.data[i * self.recsize..(i + 1) * self.recsize].to_vec()));
                }
                self.page = None;
            }
            if self.stop.load(Ordering::Relaxed) {
                return Err(errof!(UsrErr, "cursor", "cancelled"));
            }
            match self.root.move_next() {
                Ok(()) => {
                    if let Some(pg) = self.root.page() {
                        self.page = Some(PageSnap {
                            per_page: pg.len() / self.recsize,
                            data: pg.to_vec(),
                            nrec: self.root.page_records(),
                            mask: self.root.slot_mask(),
                        });
                        self.rec_idx = 0;
                    }
                }
                Err(e) if e.is_eof() => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    fn passes(&self, rec: &[u8]) -> bool {
        self.plan.full_filter.as_ref().is_none_or(|f| f.eval(rec))
    }

    /// Next logical input row: edge record, or reconstructed vertex row.
    fn next_input(&mut self) -> Result<Option<Vec<u8>>> {
        match self.plan.target {
            TargetDef::Edge(_) => loop {
                let Some(rec) = self.pull_record()? else {
                    return Ok(None);
                };
                if self.passes(&rec) {
                    return Ok(Some(rec));
                }
            },
            TargetDef::Vertex(_) => loop {
                if let Some(vr) = self.plan.vrow.as_mut()
                    && let Some(row) = vr.next_ready()
                {
                    if self.plan.full_filter.as_ref().is_none_or(|f| f.eval(&row)) {
                        return Ok(Some(row));
                    }
                    continue;
                }
                match self.pull_record()? {
                    Some(rec) => {
                        let triple = Vertex::decode(&rec);
                        if let Some(vr) = self.plan.vrow.as_mut() {
                            vr.add(&triple);
                        }
                    }
                    None => {
                        if self.forced {
                            return Ok(None);
                        }
                        self.forced = true;
                        if let Some(vr) = self.plan.vrow.as_mut() {
                            vr.force();
                        }
                    }
                }
            },
        }
    }

    fn project(&mut self, rec: &[u8]) -> Result<Vec<Value>> {
        let mut out = Vec::with_capacity(self.plan.projection.len());
        for p in &self.plan.projection {
            out.push(p.expr.eval(rec, &mut self.ctx)?);
        }
        Ok(out)
    }

    // ---- materialised modes ---------------------------------------------

    fn prepare(&mut self) -> Result<()> {
        match &self.plan.reader {
            ReaderSpec::CountRange { .. } => self.prepare_counts()?,
            ReaderSpec::KeyRange { .. } => self.prepare_keys()?,
            _ if self.plan.has_aggs() || !self.plan.group_by.is_empty() => {
                self.prepare_groups()?;
            }
            _ => {
                // plain rows, materialised for order-by
                while let Some(rec) = self.next_input()? {
                    let row = self.project(&rec)?;
                    self.rows.push_back(row);
                }
            }
        }
        if !self.plan.order_by.is_empty() {
            let order = self.plan.order_by.clone();
            let mut rows: Vec<Vec<Value>> = self.rows.drain(..).collect();
            rows.sort_by(|a, b| {
                for (i, dir) in &order {
                    let c = a[*i].cmp_with(&b[*i]);
                    if c != std::cmp::Ordering::Equal {
                        return if *dir == crate::types::Ord_::Desc { c.reverse() } else { c };
                    }
                }
                std::cmp::Ordering::Equal
            });
            self.rows = rows.into();
        }
        Ok(())
    }

    /// Count-only: sum the per-key bitmap counts from the index and scan
    /// only the unindexed tail pages.
    fn prepare_counts(&mut self) -> Result<()> {
        let mut total: u64 = 0;
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Err(errof!(UsrErr, "cursor", "cancelled"));
            }
            match self.root.move_next() {
                Ok(()) => {}
                Err(e) if e.is_eof() => break,
                Err(e) => return Err(e),
            }
            if let Some(n) = self.root.row_count() {
                total += n;
            } else if self.root.page().is_some() {
                let snap = PageSnap {
                    per_page: self.root.page().expect("page present").len() / self.recsize,
                    data: self.root.page().expect("page present").to_vec(),
                    nrec: self.root.page_records(),
                    mask: self.root.slot_mask(),
                };
                for i in 0..snap.nrec {
                    let rec = &snap.data[i * self.recsize..(i + 1) * self.recsize];
                    if self.plan.full_filter.as_ref().is_none_or(|f| f.eval(rec)) {
                        total += 1;
                    }
                }
            }
        }
        self.ctx.aggs = vec![Value::UInt(total)];
        let row = self.project(&[])?;
        self.rows.push_back(row);
        Ok(())
    }

    /// Keys-only: distinct keys from the index plus keys extracted from
    /// tail records, presented in key order via a synthesised record.
    fn prepare_keys(&mut self) -> Result<()> {
        let ReaderSpec::KeyRange { index, .. } = &self.plan.reader else {
            return Ok(());
        };
        let keys = index.keys.clone();
        let mut seen: Vec<Vec<u8>> = Vec::new();
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Err(errof!(UsrErr, "cursor", "cancelled"));
            }
            match self.root.move_next() {
                Ok(()) => {}
                Err(e) if e.is_eof() => break,
                Err(e) => return Err(e),
            }
            if let Some(pg) = self.root.page() {
                let nrec = self.root.page_records();
                let data = pg.to_vec();
                for i in 0..nrec {
                    let rec = &data[i * self.recsize..(i + 1) * self.recsize];
                    if self.plan.full_filter.as_ref().is_none_or(|f| f.eval(rec)) {
                        seen.push(keys.extract(rec));
                    }
                }
            } else if let Some(k) = self.root.key() {
                seen.push(k.to_vec());
            }
        }
        seen.sort_by(|a, b| keys.compare_keys(a, b));
        seen.dedup();
        for k in seen {
            let mut rec = vec![0u8; self.recsize];
            let mut pos = 0;
            for &off in &keys.offs {
                let sz = keys.field_size(off);
                rec[off as usize..off as usize + sz].copy_from_slice(&k[pos..pos + sz]);
                pos += sz;
            }
            let row = self.project(&rec)?;
            self.rows.push_back(row);
        }
        Ok(())
    }

    /// Hash grouping with running aggregate state per group.
    fn prepare_groups(&mut self) -> Result<()> {
        let mut index: HashMap<Vec<u8>, usize> = HashMap::new();
        let mut groups: Vec<(Vec<Value>, Vec<AggState>)> = Vec::new();
        while let Some(rec) = self.next_input()? {
            let mut keyvals = Vec::with_capacity(self.plan.group_by.len());
            for gi in 0..self.plan.group_by.len() {
                let pi = self.plan.group_by[gi];
                let v = self.plan.projection[pi].expr.eval(&rec, &mut self.ctx)?;
                keyvals.push(v);
            }
            let keybytes = wire::encode_row(&keyvals);
            let gi = match index.get(&keybytes) {
                Some(&i) => i,
                None => {
                    let states =
                        self.plan.aggs.iter().map(|a| AggState::new(a.kind)).collect();
                    groups.push((keyvals, states));
                    index.insert(keybytes, groups.len() - 1);
                    groups.len() - 1
                }
            };
            for ai in 0..self.plan.aggs.len() {
                let v = match &self.plan.aggs[ai].expr {
                    None => None,
                    Some(e) => Some(e.eval(&rec, &mut self.ctx)?),
                };
                match v {
                    None => groups[gi].1[ai].bump(),
                    Some(v) => groups[gi].1[ai].update(&v),
                }
            }
        }
        if groups.is_empty() && self.plan.group_by.is_empty() && self.plan.has_aggs() {
            // aggregates over an empty input still yield one row
            let states: Vec<AggState> =
                self.plan.aggs.iter().map(|a| AggState::new(a.kind)).collect();
            groups.push((Vec::new(), states));
        }
        // deterministic output order
        groups.sort_by(|a, b| {
            for (x, y) in a.0.iter().zip(b.0.iter()) {
                let c = x.cmp_with(y);
                if c != std::cmp::Ordering::Equal {
                    return c;
                }
            }
            std::cmp::Ordering::Equal
        });
        for (keyvals, states) in groups {
            self.ctx.aggs = states.iter().map(AggState::value).collect();
            let mut row = Vec::with_capacity(self.plan.projection.len());
            for i in 0..self.plan.projection.len() {
                if let Some(pos) = self.plan.group_by.iter().position(|&g| g == i) {
                    row.push(keyvals[pos].clone());
                } else {
                    let v = self.plan.projection[i].expr.eval(&[], &mut self.ctx)?;
                    row.push(v);
                }
            }
            self.rows.push_back(row);
        }
        Ok(())
    }

    // ---- emission --------------------------------------------------------

    /// Run the pipeline until the output buffer is full or the input is
    /// exhausted. Returns (bytes written, rows started). Fails with `eof`
    /// when the cursor is exhausted and nothing was written.
    pub fn fetch(&mut self, buf: &mut [u8]) -> Result<(usize, u32)> {
        if self.materializes() && !self.prepared {
            self.prepare()?;
            self.prepared = true;
        }
        let mut osize = 0;
        let mut cnt = 0u32;
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.len() - osize);
                buf[osize..osize + n].copy_from_slice(&self.pending[..n]);
                self.pending.drain(..n);
                osize += n;
                if osize == buf.len() {
                    return Ok((osize, cnt));
                }
            }
            if self.eof {
                if osize == 0 && cnt == 0 {
                    return Err(errof!(Eof, "cursor"));
                }
                return Ok((osize, cnt));
            }
            let next = if self.materializes() {
                self.rows.pop_front()
            } else {
                match self.next_input()? {
                    Some(rec) => Some(self.project(&rec)?),
                    None => None,
                }
            };
            match next {
                Some(values) => {
                    self.pending = wire::encode_row(&values);
                    cnt += 1;
                    self.total_rows += 1;
                }
                None => {
                    self.eof = true;
                }
            }
        }
    }

    /// The reader choice actually executing (explain output).
    #[must_use]
    pub fn reader_kind(&self) -> &'static str {
        self.plan.reader_kind()
    }

    /// Cursors are always safe to destroy after close.
    pub fn close(&mut self) {
        self.page = None;
        self.rows.clear();
        self.pending.clear();
        self.eof = true;
    }
}
