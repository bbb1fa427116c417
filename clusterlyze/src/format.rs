// Generic formatting code for a set of data extracted from a data structure to be presented
// columnar or as csv, with or without a header.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::io;

/// Return the known fields in `spec` wrt the formatters.  Unknown field names are an error.

pub fn parse_fields<'a, FmtT>(spec: &'a str, formatters: &HashMap<String, FmtT>) -> Result<Vec<&'a str>> {
    let mut fields = vec![];
    let mut others = vec![];
    for x in spec.split(',') {
        if formatters.contains_key(x) {
            fields.push(x);
        } else {
            others.push(x);
        }
    }
    if !others.is_empty() {
        bail!("Unknown field(s): {}", others.join(","));
    }
    if fields.is_empty() {
        bail!("No output fields");
    }
    Ok(fields)
}

/// The `fields` are the names of formatting functions to get from the `formatters`, these are
/// applied to the `data`.  Set `header` to true to print a first row with field names as a header
/// (independent of csv).  Set `csv` to true to get CSV output instead of fixed-format.

pub fn format_data<'a, DataT, FmtT, CtxT>(
    output: &mut dyn io::Write,
    fields: &[&'a str],
    formatters: &HashMap<String, FmtT>,
    header: bool,
    csv: bool,
    data: &[DataT],
    ctx: CtxT,
) -> Result<()>
where
    FmtT: Fn(&DataT, CtxT) -> String,
    CtxT: Copy,
{
    let fmts = fields
        .iter()
        .map(|kwd| match formatters.get(*kwd) {
            Some(f) => Ok(f),
            None => bail!("Unknown field {kwd}"),
        })
        .collect::<Result<Vec<&FmtT>>>()?;
    let rows = data
        .iter()
        .map(|x| fmts.iter().map(|f| f(x, ctx)).collect::<Vec<String>>())
        .collect::<Vec<Vec<String>>>();

    if csv {
        let mut writer = csv::Writer::from_writer(output);
        if header {
            writer.write_record(fields)?;
        }
        for row in &rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        return Ok(());
    }

    // The column width is the max across all the entries in the column (including header, if
    // present)
    let mut widths = vec![0; fields.len()];
    if header {
        for (w, kwd) in widths.iter_mut().zip(fields) {
            *w = usize::max(*w, kwd.len());
        }
    }
    for row in &rows {
        for (w, val) in widths.iter_mut().zip(row) {
            *w = usize::max(*w, val.len());
        }
    }

    if header {
        for (w, kwd) in widths.iter().zip(fields) {
            write!(output, "{:w$}  ", kwd, w = *w)?;
        }
        writeln!(output)?;
    }
    for row in &rows {
        for (w, val) in widths.iter().zip(row) {
            write!(output, "{:w$}  ", val, w = *w)?;
        }
        writeln!(output)?;
    }
    Ok(())
}

#[cfg(test)]
type TestRow = (u32, &'static str);

#[cfg(test)]
fn format_n(x: &TestRow, _: bool) -> String {
    x.0.to_string()
}

#[cfg(test)]
fn format_name(x: &TestRow, _: bool) -> String {
    x.1.to_string()
}

#[cfg(test)]
fn test_formatters() -> HashMap<String, &'static dyn Fn(&TestRow, bool) -> String> {
    let mut formatters: HashMap<String, &'static dyn Fn(&TestRow, bool) -> String> = HashMap::new();
    formatters.insert("n".to_string(), &format_n);
    formatters.insert("name".to_string(), &format_name);
    formatters
}

#[test]
fn test_parse_fields() {
    let formatters = test_formatters();
    assert!(parse_fields("name,n", &formatters).unwrap() == vec!["name", "n"]);
    assert!(parse_fields("name,bogus", &formatters).is_err());
}

#[test]
fn test_format_data() {
    let formatters = test_formatters();
    let data = vec![(1, "compute"), (12, "a,b")];

    let mut out = vec![];
    format_data(&mut out, &["n", "name"], &formatters, true, false, &data, false).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text == "n   name     \n1   compute  \n12  a,b      \n");

    let mut out = vec![];
    format_data(&mut out, &["name", "n"], &formatters, false, true, &data, false).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text == "compute,1\n\"a,b\",12\n");
}
